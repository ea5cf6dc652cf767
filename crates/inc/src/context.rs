//! Client-side handle for one connection to a server. Drives the handshake
//! state machine, tracks in-flight method calls by sequence number, and
//! relays inbound events/binary data to the caller's `poll` loop.
//!
//! Reconnection itself is mostly delegated to
//! `inc_network::tcp::TcpConnector`, which already retries outbound
//! connections on its own interval; `Context` layers a bounded attempt
//! counter on top of that and calls `cancel_reconnect` once
//! `ReconnectConfig::max_reconnect_attempts` is exceeded (or immediately, if
//! auto-reconnect is disabled).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use inc_communication::{BlockKind, MemBlock, MemExport, MemImport, TagStruct};
use inc_network::frame::{self, ErrorCode, Header, Message, MessageFlags, MessageType};
use inc_network::tcp::{PollEvent, SendBehavior, TcpConnector};
use inc_network::transport::TransportUrl;
use inc_timing::{Duration, Instant};
use mio::Token;
use tracing::{debug, info, warn};

use crate::connection::{decode_shm_ref, encode_shm_ref, ConnectionState};
use crate::error::IncError;
use crate::operation::Operation;
use crate::subscription::SubscriptionList;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { auto_reconnect: true, reconnect_interval: Duration::from_secs(2), max_reconnect_attempts: None }
    }
}

/// Surfaced to the caller from `Context::poll`.
pub enum ContextEvent {
    StateChanged(ConnectionState),
    Event { name: String, payload: TagStruct },
    BinaryData { channel_id: u32, sequence: u32, payload: Bytes },
    BinaryAck { channel_id: u32, sequence: u32 },
    ChannelClosed { channel_id: u32 },
}

/// First leg of the handshake, sent as the connector's `on_connect_msg`:
/// carries the client's `(current, min, max)` protocol version window.
/// `HelloAck` for this leg is received while still `Authorizing`.
fn encode_hello_version() -> Message {
    let mut payload = TagStruct::new();
    payload.put_u16(frame::PROTOCOL_VERSION);
    payload.put_u16(frame::PROTOCOL_VERSION);
    payload.put_u16(frame::PROTOCOL_VERSION);
    Message::control(MessageType::Hello, 0, Bytes::from(payload.into_bytes()))
}

/// Second leg: sent once version negotiation succeeds, while `SettingName`.
/// The matching `HelloAck` carries the server's name and moves to `Ready`.
fn encode_hello_name(client_name: &str) -> Message {
    let mut payload = TagStruct::new();
    payload.put_string(client_name);
    Message::control(MessageType::Hello, 0, Bytes::from(payload.into_bytes()))
}

/// Client-side connection handle. One per logical connection to a server;
/// applications drive it by calling `poll` from their own event loop.
pub struct Context {
    connector: TcpConnector,
    token: Option<Token>,
    state: ConnectionState,
    client_name: String,
    sequence: AtomicU32,
    ops: Mutex<HashMap<u32, Operation<TagStruct>>>,
    subscriptions: SubscriptionList,
    reconnect: ReconnectConfig,
    reconnect_attempts: u32,
    mem_export: MemExport,
    mem_import: MemImport,
}

impl Context {
    pub fn new(client_name: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        let client_name = client_name.into();
        let connector = TcpConnector::default()
            .with_reconnect_interval(reconnect.reconnect_interval)
            .with_on_connect_msg(encode_hello_version());
        Self {
            connector,
            token: None,
            state: ConnectionState::Unconnected,
            client_name,
            sequence: AtomicU32::new(1),
            ops: Mutex::new(HashMap::new()),
            subscriptions: SubscriptionList::new(),
            reconnect,
            reconnect_attempts: 0,
            mem_export: MemExport::new(),
            mem_import: MemImport::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Begins connecting to `url`. Only `tcp://` is wired to a real
    /// connector; other schemes parse but fail here with
    /// `TransportError::Unsupported`.
    pub fn connect(&mut self, url: &str) -> Result<(), IncError> {
        let addr = TransportUrl::parse(url)?.as_tcp()?;
        self.state = ConnectionState::Connecting;
        self.reconnect_attempts = 0;
        self.token = self.connector.connect(addr);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(token) = self.token.take() {
            self.connector.disconnect(token);
            self.connector.cancel_reconnect(token);
        }
        self.state = ConnectionState::Terminated;
        self.fail_all_ops();
    }

    fn fail_all_ops(&self) {
        let mut ops = self.ops.lock().expect("context op map mutex poisoned");
        for (_, op) in ops.drain() {
            op.fail(IncError::NotConnected);
        }
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&mut self, msg: &Message) -> Result<(), IncError> {
        let token = self.token.ok_or(IncError::NotConnected)?;
        self.connector.write_or_enqueue(SendBehavior::Single(token), msg);
        Ok(())
    }

    /// Issues a `METHOD_CALL`. Completion (reply, error, or timeout) arrives
    /// through the returned `Operation`, which is driven forward by `poll`.
    pub fn call_method(
        &mut self,
        name: &str,
        version: u16,
        args: &TagStruct,
        timeout: Option<Duration>,
    ) -> Result<Operation<TagStruct>, IncError> {
        if self.state != ConnectionState::Ready {
            return Err(IncError::NotConnected);
        }
        let seq = self.next_sequence();
        let op = Operation::new(seq, timeout);

        let mut payload = TagStruct::new();
        payload.put_string(name);
        payload.put_u16(version);
        payload.put_bytes(args.as_bytes());
        let msg = Message::control(MessageType::MethodCall, seq, Bytes::from(payload.into_bytes()));

        self.ops.lock().expect("context op map mutex poisoned").insert(seq, op.clone());
        self.send(&msg)?;
        Ok(op)
    }

    pub fn subscribe(&mut self, pattern: &str) -> Result<(), IncError> {
        self.subscriptions.subscribe(pattern);
        let seq = self.next_sequence();
        let mut payload = TagStruct::new();
        payload.put_string(pattern);
        let msg = Message::control(MessageType::Subscribe, seq, Bytes::from(payload.into_bytes()));
        self.send(&msg)
    }

    pub fn unsubscribe(&mut self, pattern: &str) -> Result<(), IncError> {
        self.subscriptions.unsubscribe(pattern);
        let seq = self.next_sequence();
        let mut payload = TagStruct::new();
        payload.put_string(pattern);
        let msg = Message::control(MessageType::Unsubscribe, seq, Bytes::from(payload.into_bytes()));
        self.send(&msg)
    }

    pub fn ping(&mut self) -> Result<(), IncError> {
        let seq = self.next_sequence();
        let msg = Message::control(MessageType::Ping, seq, Bytes::new());
        self.send(&msg)
    }

    /// Sends a `CHANNEL_OPEN` request and returns the sequence number the
    /// `CHANNEL_OPEN_REPLY` will echo; `Stream::attach` uses this directly.
    pub fn open_channel(&mut self, mode_byte: u8) -> Result<u32, IncError> {
        let seq = self.next_sequence();
        let payload = Bytes::copy_from_slice(&[mode_byte]);
        let msg = Message::control(MessageType::ChannelOpen, seq, payload);
        self.send(&msg)?;
        Ok(seq)
    }

    /// Sends `data` as `BINARY_DATA`. When `has_shm` is set the bytes are
    /// exported through a shared-memory segment instead of traveling inline:
    /// the wire payload becomes a `(blockType, blockID, shmSegmentID,
    /// offset, size)` reference the peer's `MemImport` resolves back into a
    /// block, rather than the raw bytes.
    pub fn write_binary(&mut self, channel_id: u32, sequence: u32, data: Bytes, has_shm: bool) -> Result<(), IncError> {
        if !has_shm {
            let msg = Message::new(MessageType::BinaryData, channel_id, sequence, MessageFlags::empty(), data);
            return self.send(&msg);
        }
        let len = data.len();
        let block = MemBlock::from_user_pointer(data.to_vec(), move || {
            tracing::trace!(channel_id, sequence, "shm-exported binary data released by peer");
        });
        let (remote_id, segment_name) = self.mem_export.put_shared(&self.client_name, block)?;
        let reference = encode_shm_ref(BlockKind::User, remote_id, &segment_name, 0, len as u32);
        let msg = Message::new(MessageType::BinaryData, channel_id, sequence, MessageFlags::HAS_SHM_REF, reference);
        self.send(&msg)
    }

    pub fn close_channel(&mut self, channel_id: u32) -> Result<(), IncError> {
        let seq = self.next_sequence();
        let msg = Message::new(MessageType::ChannelClose, channel_id, seq, MessageFlags::empty(), Bytes::new());
        self.send(&msg)
    }

    /// Drives handshake, reconnect, timeout, and message dispatch. Must be
    /// called regularly from the application's event loop; returns the
    /// events that accumulated during this tick.
    pub fn poll(&mut self) -> Vec<ContextEvent> {
        let my_token = self.token;
        let mut out = Vec::new();
        let mut hello_sent = false;
        let mut new_state: Option<ConnectionState> = None;
        let mut disconnected = false;
        let mut pending_sends: Vec<Message> = Vec::new();

        let ops = &self.ops;
        let subs = self.subscriptions.clone();
        let mem_import = &self.mem_import;
        let client_name = self.client_name.clone();
        let current_state = self.state;

        self.connector.poll_with(|ev| match ev {
            PollEvent::Accept { stream, peer_addr, .. } => {
                if my_token.is_none() || my_token == Some(stream) {
                    debug!(?peer_addr, "connected, version hello sent");
                    hello_sent = true;
                }
            }
            PollEvent::Disconnect { token } => {
                if my_token == Some(token) {
                    disconnected = true;
                    let mut ops = ops.lock().expect("context op map mutex poisoned");
                    for (_, op) in ops.drain() {
                        op.fail(IncError::NotConnected);
                    }
                }
            }
            PollEvent::Message { token, header, payload } => {
                if my_token != Some(token) {
                    return;
                }
                match header.msg_type {
                    MessageType::HelloAck => {
                        let mut tag = TagStruct::from_bytes(payload);
                        let ok = matches!(tag.get_bool(), Ok(true));
                        match current_state {
                            ConnectionState::Authorizing if ok => {
                                new_state = Some(ConnectionState::SettingName);
                                pending_sends.push(encode_hello_name(&client_name));
                            }
                            ConnectionState::SettingName if ok => {
                                new_state = Some(ConnectionState::Ready);
                            }
                            _ => new_state = Some(ConnectionState::Failed),
                        }
                    }
                    MessageType::MethodReply => complete_method_reply(ops, &header, payload, true),
                    MessageType::MethodError => complete_method_reply(ops, &header, payload, false),
                    MessageType::Event => {
                        if let Some(event) = decode_event(&subs, payload) {
                            out.push(event);
                        }
                    }
                    MessageType::BinaryData => {
                        let resolved = if header.flags.contains(MessageFlags::HAS_SHM_REF) {
                            decode_shm_ref(payload)
                                .and_then(|(_, remote_id, segment_name, offset, size)| {
                                    mem_import
                                        .put_from_segment(remote_id, &segment_name, offset as usize, size as usize)
                                        .ok()
                                })
                                .map(|block| Bytes::copy_from_slice(&block.acquire()))
                        } else {
                            Some(Bytes::copy_from_slice(payload))
                        };
                        if let Some(payload) = resolved {
                            out.push(ContextEvent::BinaryData {
                                channel_id: header.channel_id,
                                sequence: header.sequence,
                                payload,
                            });
                        } else {
                            warn!(channel_id = header.channel_id, "couldn't resolve shm-backed binary data");
                        }
                    }
                    MessageType::BinaryAck => out.push(ContextEvent::BinaryAck {
                        channel_id: header.channel_id,
                        sequence: header.sequence,
                    }),
                    MessageType::ChannelCloseReply => {
                        out.push(ContextEvent::ChannelClosed { channel_id: header.channel_id })
                    }
                    _ => {}
                }
            }
        });

        {
            let now = Instant::now();
            let mut ops = self.ops.lock().expect("context op map mutex poisoned");
            let timed_out: Vec<u32> =
                ops.iter().filter_map(|(seq, op)| op.poll_timeout(now).then_some(*seq)).collect();
            for seq in timed_out {
                ops.remove(&seq);
            }
        }

        if hello_sent && new_state.is_none() {
            new_state = Some(ConnectionState::Authorizing);
        }

        if disconnected {
            let exhausted = if !self.reconnect.auto_reconnect {
                true
            } else {
                self.reconnect_attempts += 1;
                self.reconnect.max_reconnect_attempts.is_some_and(|max| self.reconnect_attempts > max)
            };
            if exhausted {
                if let Some(token) = my_token {
                    self.connector.cancel_reconnect(token);
                }
                new_state = Some(ConnectionState::Failed);
            } else {
                warn!(attempt = self.reconnect_attempts, "connection lost, reconnecting");
                new_state = Some(ConnectionState::Connecting);
            }
        }

        for msg in pending_sends {
            let _ = self.send(&msg);
        }

        if let Some(state) = new_state {
            if state == ConnectionState::Ready {
                self.reconnect_attempts = 0;
                info!("ready");
            }
            self.state = state;
            out.push(ContextEvent::StateChanged(state));
        }
        out
    }
}

fn complete_method_reply(
    ops: &Mutex<HashMap<u32, Operation<TagStruct>>>,
    header: &Header,
    payload: &[u8],
    ok: bool,
) {
    let op = ops.lock().expect("context op map mutex poisoned").remove(&header.sequence);
    let Some(op) = op else { return };
    if ok {
        op.set_result(TagStruct::from_bytes(payload));
    } else {
        let code = TagStruct::from_bytes(payload)
            .get_u16()
            .ok()
            .and_then(ErrorCode::from_u16)
            .unwrap_or(ErrorCode::Unknown);
        op.fail(IncError::Protocol(code));
    }
}

fn decode_event(subs: &SubscriptionList, payload: &[u8]) -> Option<ContextEvent> {
    let mut tag = TagStruct::from_bytes(payload);
    let name = tag.get_string().ok()?;
    if !subs.matches(&name) {
        return None;
    }
    let rest = TagStruct::from_bytes(tag.remaining_bytes());
    Some(ContextEvent::Event { name, payload: rest })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_starts_unconnected_and_rejects_calls() {
        let mut ctx = Context::new("test-client", ReconnectConfig::default());
        assert_eq!(ctx.state(), ConnectionState::Unconnected);
        let err = ctx.call_method("echo", 1, &TagStruct::new(), None).unwrap_err();
        assert!(matches!(err, IncError::NotConnected));
    }

    #[test]
    fn disconnect_fails_all_pending_operations() {
        let mut ctx = Context::new("test-client", ReconnectConfig::default());
        ctx.state = ConnectionState::Ready;
        ctx.token = Some(Token(0));
        let op = ctx.call_method("echo", 1, &TagStruct::new(), None).unwrap();
        ctx.disconnect();
        assert_eq!(ctx.state(), ConnectionState::Terminated);
        assert!(op.is_terminal());
    }

    #[test]
    fn timed_out_operation_transitions_via_poll() {
        let mut ctx = Context::new("test-client", ReconnectConfig::default());
        ctx.state = ConnectionState::Ready;
        ctx.token = Some(Token(0));
        let op = ctx.call_method("echo", 1, &TagStruct::new(), Some(Duration::from_millis(1))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        ctx.poll();
        assert!(op.is_terminal());
        assert!(matches!(op.state(), crate::operation::OpState::TimedOut));
    }
}
