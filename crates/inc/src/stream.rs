//! Channel-scoped binary transfer on top of one `Context`'s connection.
//! `attach` opens a channel via `CHANNEL_OPEN`, `write` sends `BINARY_DATA`
//! (optionally flagged as shared-memory backed), `read` drains inbound
//! chunks the owner has fed in from `Context::poll`, and `detach` closes
//! the channel. State transitions are driven externally — `Stream` itself
//! does no I/O polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use inc_communication::{CHUNK_CAPACITY, ChunkQueue, TagStruct};
use inc_network::frame::ErrorCode;

use crate::connection::ChannelMode;
use crate::context::Context;
use crate::error::IncError;
use crate::operation::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Detached,
    Attaching,
    Attached,
    Detaching,
    Error,
}

pub struct Stream {
    mode: ChannelMode,
    state: StreamState,
    channel_id: Option<u32>,
    attach_sequence: Option<u32>,
    detach_sequence: Option<u32>,
    write_sequence: AtomicU32,
    incoming: ChunkQueue,
    pending_writes: HashMap<u32, Operation<()>>,
}

impl Stream {
    pub fn new(mode: ChannelMode) -> Self {
        Self {
            mode,
            state: StreamState::Detached,
            channel_id: None,
            attach_sequence: None,
            detach_sequence: None,
            write_sequence: AtomicU32::new(0),
            incoming: ChunkQueue::with_capacity(64),
            pending_writes: HashMap::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn channel_id(&self) -> Option<u32> {
        self.channel_id
    }

    /// Sends `CHANNEL_OPEN` as an RPC. Call `on_channel_open_reply` with the
    /// matching `CHANNEL_OPEN_REPLY` payload to complete the transition.
    pub fn attach(&mut self, ctx: &mut Context) -> Result<(), IncError> {
        if self.state != StreamState::Detached {
            return Err(IncError::Protocol(ErrorCode::InvalidState));
        }
        let mode_byte = match self.mode {
            ChannelMode::Read => 0,
            ChannelMode::Write => 1,
            ChannelMode::ReadWrite => 2,
        };
        let seq = ctx.open_channel(mode_byte)?;
        self.attach_sequence = Some(seq);
        self.state = StreamState::Attaching;
        Ok(())
    }

    /// Feeds a `CHANNEL_OPEN_REPLY` payload for `sequence` (encoded as
    /// `server::handle_message` does: `bool success` then `u32 channel_id`
    /// or `u16 error_code`). Returns whether this reply belonged to this
    /// stream's pending attach.
    pub fn on_channel_open_reply(&mut self, sequence: u32, payload: &[u8]) -> bool {
        if self.attach_sequence.take() != Some(sequence) {
            return false;
        }
        let mut tag = TagStruct::from_bytes(payload);
        if matches!(tag.get_bool(), Ok(true)) {
            if let Ok(channel_id) = tag.get_u32() {
                self.channel_id = Some(channel_id);
                self.state = StreamState::Attached;
                return true;
            }
        }
        self.state = StreamState::Error;
        true
    }

    /// Encodes and sends one write. The returned `Operation` completes when
    /// the matching `BINARY_ACK` arrives — feed `Context::poll`'s
    /// `ContextEvent::BinaryAck` to `on_binary_ack` to drive it.
    pub fn write(&mut self, ctx: &mut Context, data: Bytes, has_shm: bool) -> Result<Operation<()>, IncError> {
        let channel_id = self.channel_id.ok_or(IncError::Protocol(ErrorCode::InvalidState))?;
        if self.state != StreamState::Attached || self.mode == ChannelMode::Read {
            return Err(IncError::Protocol(ErrorCode::InvalidState));
        }
        let seq = self.write_sequence.fetch_add(1, Ordering::Relaxed);
        ctx.write_binary(channel_id, seq, data, has_shm)?;
        let op = Operation::new(seq, None);
        self.pending_writes.insert(seq, op.clone());
        Ok(op)
    }

    /// Feeds a `BINARY_ACK` for `sequence`, completing the matching pending
    /// write's `Operation`. Returns whether this ack belonged to this stream.
    pub fn on_binary_ack(&mut self, sequence: u32) -> bool {
        match self.pending_writes.remove(&sequence) {
            Some(op) => {
                op.set_result(());
                true
            }
            None => false,
        }
    }

    /// Called by the owner when a `BINARY_DATA` frame addressed to this
    /// stream's channel arrives; splits it into the chunk queue's fixed
    /// slot size before enqueueing.
    pub fn on_binary_data(&mut self, position: u64, data: &[u8]) {
        for (i, part) in data.chunks(CHUNK_CAPACITY).enumerate() {
            self.incoming.push(position + (i * CHUNK_CAPACITY) as u64, part);
        }
    }

    /// Pops the next received chunk, if any.
    pub fn read(&mut self) -> Option<(u64, Vec<u8>)> {
        self.incoming.pop()
    }

    /// Sends `CHANNEL_CLOSE`. Transition to `Detached` completes in
    /// `on_channel_close_reply`; idempotent if already detached.
    pub fn detach(&mut self, ctx: &mut Context) -> Result<(), IncError> {
        let Some(channel_id) = self.channel_id else {
            self.state = StreamState::Detached;
            return Ok(());
        };
        if self.state == StreamState::Detached || self.state == StreamState::Detaching {
            return Ok(());
        }
        self.detach_sequence = Some(self.write_sequence.load(Ordering::Relaxed));
        ctx.close_channel(channel_id)?;
        self.state = StreamState::Detaching;
        Ok(())
    }

    pub fn on_channel_close_reply(&mut self, channel_id: u32) -> bool {
        if self.channel_id != Some(channel_id) {
            return false;
        }
        self.channel_id = None;
        self.state = StreamState::Detached;
        for (_, op) in self.pending_writes.drain() {
            op.fail(IncError::NotConnected);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_then_successful_reply_moves_to_attached() {
        let mut stream = Stream::new(ChannelMode::ReadWrite);
        stream.attach_sequence = Some(5);
        stream.state = StreamState::Attaching;

        let mut body = TagStruct::new();
        body.put_bool(true);
        body.put_u32(7);
        assert!(stream.on_channel_open_reply(5, body.as_bytes()));
        assert_eq!(stream.state(), StreamState::Attached);
        assert_eq!(stream.channel_id(), Some(7));
    }

    #[test]
    fn failed_open_reply_sets_error_state() {
        let mut stream = Stream::new(ChannelMode::ReadWrite);
        stream.attach_sequence = Some(1);
        stream.state = StreamState::Attaching;

        let mut body = TagStruct::new();
        body.put_bool(false);
        body.put_u16(ErrorCode::TooManyConns.code());
        assert!(stream.on_channel_open_reply(1, body.as_bytes()));
        assert_eq!(stream.state(), StreamState::Error);
    }

    #[test]
    fn binary_data_round_trips_through_read() {
        let mut stream = Stream::new(ChannelMode::Read);
        stream.on_binary_data(0, b"hello world");
        let (pos, data) = stream.read().expect("chunk");
        assert_eq!(pos, 0);
        assert_eq!(data, b"hello world");
        assert!(stream.read().is_none());
    }

    #[test]
    fn on_binary_ack_completes_the_matching_write_and_ignores_others() {
        let mut stream = Stream::new(ChannelMode::Write);
        let op: Operation<()> = Operation::new(3, None);
        stream.pending_writes.insert(3, op.clone());

        assert!(!stream.on_binary_ack(4), "unrelated sequence must not match");
        assert!(!op.is_terminal());

        assert!(stream.on_binary_ack(3));
        assert!(op.is_terminal());
        assert!(!stream.on_binary_ack(3), "already-acked sequence has nothing left to complete");
    }

    #[test]
    fn detach_with_no_channel_is_a_no_op() {
        let mut stream = Stream::new(ChannelMode::Read);
        let mut ctx = Context::new("t", Default::default());
        assert!(stream.detach(&mut ctx).is_ok());
        assert_eq!(stream.state(), StreamState::Detached);
    }
}
