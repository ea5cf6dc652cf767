//! Per-peer bookkeeping shared by both ends of the wire: handshake state,
//! subscriptions, and the channel/shared-memory tables scoped to one
//! connection. Owns no socket itself — token routing and actual I/O live in
//! `inc_network::tcp::TcpConnector`; this is the metadata the engine hangs
//! off that token.

use std::collections::HashMap;

use bytes::Bytes;
use inc_communication::{BlockKind, MemExport, MemImport, TagStruct};
use mio::Token;

use crate::subscription::SubscriptionList;

/// Encodes the `HAS_SHM_REF` cross-process reference: `(blockType, blockID,
/// shmSegmentID, offset, size)`. This is what travels as the `BINARY_DATA`
/// payload instead of the raw bytes whenever a block is exported via shared
/// memory rather than inlined.
pub fn encode_shm_ref(kind: BlockKind, remote_id: u32, segment_name: &str, offset: u32, size: u32) -> Bytes {
    let mut tag = TagStruct::new();
    tag.put_u8(kind.wire_tag());
    tag.put_u32(remote_id);
    tag.put_string(segment_name);
    tag.put_u32(offset);
    tag.put_u32(size);
    Bytes::from(tag.into_bytes())
}

/// Inverse of `encode_shm_ref`. Returns `None` on a malformed payload rather
/// than panicking, so the caller can drop the frame without tearing down the
/// connection.
pub fn decode_shm_ref(payload: &[u8]) -> Option<(BlockKind, u32, String, u32, u32)> {
    let mut tag = TagStruct::from_bytes(payload);
    let kind = BlockKind::from_wire_tag(tag.get_u8().ok()?)?;
    let remote_id = tag.get_u32().ok()?;
    let segment_name = tag.get_string().ok()?;
    let offset = tag.get_u32().ok()?;
    let size = tag.get_u32().ok()?;
    Some((kind, remote_id, segment_name, offset, size))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Authorizing,
    SettingName,
    Ready,
    Failed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Read,
    Write,
    ReadWrite,
}

/// Per-connection channel ID allocator. Channel 0 is reserved for
/// control-plane traffic, so IDs here always start at 1.
#[derive(Debug)]
pub struct ChannelTable {
    channels: HashMap<u32, ChannelMode>,
    next_id: u32,
    max_channels: usize,
}

impl ChannelTable {
    pub fn new(max_channels: usize) -> Self {
        Self { channels: HashMap::new(), next_id: 1, max_channels }
    }

    /// Allocates the first unused ID, enforcing this connection's channel
    /// quota. Returns `None` once the quota is exhausted.
    pub fn open(&mut self, mode: ChannelMode) -> Option<u32> {
        if self.channels.len() >= self.max_channels {
            return None;
        }
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if !self.channels.contains_key(&id) {
                self.channels.insert(id, mode);
                return Some(id);
            }
        }
    }

    pub fn close(&mut self, id: u32) -> bool {
        self.channels.remove(&id).is_some()
    }

    pub fn mode(&self, id: u32) -> Option<ChannelMode> {
        self.channels.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// One peer's worth of protocol state. The server keeps one per accepted
/// socket; `Context` keeps exactly one for the connection it owns.
pub struct Connection {
    pub id: u64,
    pub token: Token,
    pub peer_name: Option<String>,
    pub protocol_version: u16,
    pub state: ConnectionState,
    pub subscriptions: SubscriptionList,
    pub channels: ChannelTable,
    pub mem_export: MemExport,
    pub mem_import: MemImport,
}

impl Connection {
    pub fn new(id: u64, token: Token, max_channels: usize) -> Self {
        Self {
            id,
            token,
            peer_name: None,
            protocol_version: 0,
            state: ConnectionState::Unconnected,
            subscriptions: SubscriptionList::new(),
            channels: ChannelTable::new(max_channels),
            mem_export: MemExport::new(),
            mem_import: MemImport::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_table_enforces_quota() {
        let mut table = ChannelTable::new(2);
        let a = table.open(ChannelMode::Read).unwrap();
        let b = table.open(ChannelMode::Write).unwrap();
        assert_ne!(a, b);
        assert!(table.open(ChannelMode::ReadWrite).is_none());
        assert!(table.close(a));
        assert!(table.open(ChannelMode::ReadWrite).is_some());
    }

    #[test]
    fn channel_zero_is_never_allocated() {
        let mut table = ChannelTable::new(8);
        for _ in 0..4 {
            assert_ne!(table.open(ChannelMode::Read).unwrap(), 0);
        }
    }

    #[test]
    fn shm_ref_round_trips_through_the_wire_encoding() {
        let encoded = encode_shm_ref(BlockKind::User, 7, "/dev/shm/inc-export-7", 128, 4096);
        let (kind, remote_id, segment_name, offset, size) = decode_shm_ref(&encoded).expect("decodes");
        assert_eq!(kind, BlockKind::User);
        assert_eq!(remote_id, 7);
        assert_eq!(segment_name, "/dev/shm/inc-export-7");
        assert_eq!(offset, 128);
        assert_eq!(size, 4096);
    }

    #[test]
    fn shm_ref_decode_rejects_truncated_payload() {
        assert!(decode_shm_ref(&[]).is_none());
    }
}
