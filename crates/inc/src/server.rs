//! Server: owns a listening transport, one `Connection` per accepted
//! socket, a shared method table, and subscription-based event broadcast.
//! Driven by `poll`, exactly like `Context` — no background I/O thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use inc_communication::TagStruct;
use inc_network::frame::{self, ErrorCode, Header, Message, MessageFlags, MessageType};
use inc_network::tcp::{PollEvent, SendBehavior, TcpConnector};
use inc_utils::{ThreadPriority, thread_boot};
use mio::Token;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::connection::{decode_shm_ref, encode_shm_ref, ChannelMode, Connection, ConnectionState};
use crate::error::IncError;
use crate::method::{MethodOutcome, MethodTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionPolicy {
    /// The client's current version must exactly match the server's.
    Strict,
    /// Any version within the overlap of both sides' `[min, max]` windows is
    /// accepted; the highest common version wins.
    Compatible,
    /// The client's current version is clamped into the server's supported
    /// range rather than rejected.
    Permissive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionRequirement {
    Off,
    Optional,
    Preferred,
    Required,
}

/// Picks the protocol version both sides will use for the rest of the
/// connection, or `None` if `policy` rejects the client's window outright.
fn negotiate_version(policy: VersionPolicy, client: (u16, u16, u16), server: (u16, u16, u16)) -> Option<u16> {
    let (client_current, client_min, client_max) = client;
    let (server_min, server_max) = (server.1, server.2);
    match policy {
        VersionPolicy::Strict => (client_current == server.0).then_some(server.0),
        VersionPolicy::Compatible => {
            let lo = client_min.max(server_min);
            let hi = client_max.min(server_max);
            (lo <= hi).then_some(hi)
        }
        VersionPolicy::Permissive => Some(client_current.clamp(server_min, server_max)),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server_name: String,
    pub listen_address: SocketAddr,
    pub max_connections: usize,
    pub max_connections_per_client: usize,
    pub shared_memory_size: usize,
    pub disable_shared_memory: bool,
    pub disable_memfd: bool,
    pub max_message_size: u32,
    pub protocol_version_current: u16,
    pub protocol_version_min: u16,
    pub protocol_version_max: u16,
    pub version_policy: VersionPolicy,
    pub encryption_requirement: EncryptionRequirement,
    pub client_timeout_ms: u64,
    pub exit_idle_time_ms: Option<u64>,
    pub high_priority: bool,
    pub nice_level: i8,
    pub enable_io_thread: bool,
    pub max_channels_per_connection: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "inc-server".to_string(),
            listen_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_connections: 256,
            max_connections_per_client: 4,
            shared_memory_size: 16 * 1024 * 1024,
            disable_shared_memory: false,
            disable_memfd: false,
            max_message_size: frame::MAX_PAYLOAD_LEN,
            protocol_version_current: frame::PROTOCOL_VERSION,
            protocol_version_min: frame::PROTOCOL_VERSION,
            protocol_version_max: frame::PROTOCOL_VERSION,
            version_policy: VersionPolicy::Strict,
            encryption_requirement: EncryptionRequirement::Off,
            client_timeout_ms: 30_000,
            exit_idle_time_ms: None,
            high_priority: false,
            nice_level: 0,
            enable_io_thread: true,
            max_channels_per_connection: 16,
        }
    }
}

impl ServerConfig {
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

pub enum ServerEvent {
    ClientConnected { connection_id: u64 },
    ClientDisconnected { connection_id: u64 },
    BinaryData { connection_id: u64, channel_id: u32, sequence: u32, payload: Bytes },
}

pub struct Server {
    connector: TcpConnector,
    listener_token: Option<Token>,
    config: ServerConfig,
    connections: Mutex<HashMap<u64, Connection>>,
    token_to_id: Mutex<HashMap<Token, u64>>,
    next_id: AtomicU64,
    methods: Arc<MethodTable>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: ServerConfig, methods: Arc<MethodTable>) -> Self {
        Self {
            connector: TcpConnector::default(),
            listener_token: None,
            config,
            connections: Mutex::new(HashMap::new()),
            token_to_id: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            methods,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Registers `SIGTERM`/`SIGINT`/`SIGQUIT` handlers that flip
    /// `shutdown_requested()` to `true`. The run loop is expected to check
    /// it each iteration and exit cleanly; this never aborts the process
    /// itself, matching the "let the caller drive shutdown" model of `poll`.
    pub fn install_signal_handlers(&self) -> Result<(), std::io::Error> {
        use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
        signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown))?;
        signal_hook::flag::register(SIGQUIT, Arc::clone(&self.shutdown))?;
        Ok(())
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn listen(&mut self) -> Result<SocketAddr, IncError> {
        self.apply_scheduling();
        let addr = self.config.listen_address;
        let token =
            self.connector.listen_at(addr).ok_or(IncError::Protocol(ErrorCode::ConnectionFailed))?;
        self.listener_token = Some(token);
        Ok(addr)
    }

    /// Requests realtime scheduling and a nice level for the calling thread
    /// per `ServerConfig`'s `highPriority`/`niceLevel` knobs. Best-effort:
    /// failures are logged, never fatal, since the process may lack
    /// `CAP_SYS_NICE`.
    fn apply_scheduling(&self) {
        thread_boot(
            None,
            if self.config.high_priority { ThreadPriority::High } else { ThreadPriority::OSDefault },
        );
        if self.config.nice_level != 0 {
            let code = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, self.config.nice_level as i32) };
            if code != 0 {
                warn!(nice_level = self.config.nice_level, "couldn't set nice level");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("server connections mutex poisoned").len()
    }

    /// Sends `METHOD_REPLY`/`METHOD_ERROR` for a call a handler deferred.
    pub fn send_reply(&mut self, connection_id: u64, sequence: u32, outcome: Result<TagStruct, ErrorCode>) {
        let Some(token) = self.token_for(connection_id) else { return };
        let msg = encode_method_reply(sequence, outcome);
        self.connector.write_or_enqueue(SendBehavior::Single(token), &msg);
    }

    fn token_for(&self, connection_id: u64) -> Option<Token> {
        self.connections
            .lock()
            .expect("server connections mutex poisoned")
            .get(&connection_id)
            .map(|c| c.token)
    }

    /// Publishes `name`/`payload` to every `Ready` connection whose
    /// subscriptions match `name`. Connection tokens are snapshotted under
    /// the lock so the writes themselves happen without holding it.
    pub fn broadcast_event(&mut self, name: &str, payload: &TagStruct) {
        let mut event = TagStruct::new();
        event.put_string(name);
        event.put_bytes(payload.as_bytes());
        let msg = Message::control(MessageType::Event, 0, Bytes::from(event.into_bytes()));

        let targets: Vec<Token> = {
            let connections = self.connections.lock().expect("server connections mutex poisoned");
            connections
                .values()
                .filter(|c| c.is_ready() && c.subscriptions.matches(name))
                .map(|c| c.token)
                .collect()
        };
        for token in targets {
            self.connector.write_or_enqueue(SendBehavior::Single(token), &msg);
        }
    }

    pub fn poll(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        let mut pending_sends: Vec<(Token, Message)> = Vec::new();
        let connections = &self.connections;
        let token_to_id = &self.token_to_id;
        let next_id = &self.next_id;
        let methods = &*self.methods;
        let max_channels = self.config.max_channels_per_connection;
        let max_connections = self.config.max_connections;
        let version_policy = self.config.version_policy;
        let protocol_window =
            (self.config.protocol_version_current, self.config.protocol_version_min, self.config.protocol_version_max);
        let server_name = self.config.server_name.clone();

        self.connector.poll_with(|ev| match ev {
            PollEvent::Accept { stream, peer_addr, .. } => {
                let mut conns = connections.lock().expect("server connections mutex poisoned");
                if conns.len() >= max_connections {
                    warn!(?peer_addr, "rejecting connection: server full");
                    return;
                }
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let mut conn = Connection::new(id, stream, max_channels);
                conn.state = ConnectionState::Authorizing;
                conns.insert(id, conn);
                drop(conns);
                token_to_id.lock().expect("server token map mutex poisoned").insert(stream, id);
                info!(?peer_addr, connection_id = id, "client connected");
                out.push(ServerEvent::ClientConnected { connection_id: id });
            }
            PollEvent::Disconnect { token } => {
                let id = token_to_id.lock().expect("server token map mutex poisoned").remove(&token);
                if let Some(id) = id {
                    connections.lock().expect("server connections mutex poisoned").remove(&id);
                    out.push(ServerEvent::ClientDisconnected { connection_id: id });
                }
            }
            PollEvent::Message { token, header, payload } => {
                let id = token_to_id.lock().expect("server token map mutex poisoned").get(&token).copied();
                let Some(id) = id else { return };
                handle_message(
                    connections,
                    methods,
                    id,
                    token,
                    &header,
                    payload,
                    version_policy,
                    protocol_window,
                    &server_name,
                    &mut out,
                    &mut pending_sends,
                );
            }
        });

        for (token, msg) in pending_sends {
            self.connector.write_or_enqueue(SendBehavior::Single(token), &msg);
        }
        out
    }
}

/// First handshake leg's ack: whether the client's version window was
/// accepted and, if so, the negotiated version.
fn encode_hello_ack_version(sequence: u32, ok: bool, version: u16) -> Message {
    let mut body = TagStruct::new();
    body.put_bool(ok);
    if ok {
        body.put_u16(version);
    }
    Message::control(MessageType::HelloAck, sequence, Bytes::from(body.into_bytes()))
}

/// Second handshake leg's ack: the server's name and the finalized version.
fn encode_hello_ack_name(sequence: u32, ok: bool, server_name: &str, version: u16) -> Message {
    let mut body = TagStruct::new();
    body.put_bool(ok);
    if ok {
        body.put_string(server_name);
        body.put_u16(version);
    }
    Message::control(MessageType::HelloAck, sequence, Bytes::from(body.into_bytes()))
}

fn encode_method_reply(sequence: u32, outcome: Result<TagStruct, ErrorCode>) -> Message {
    match outcome {
        Ok(result) => Message::control(MessageType::MethodReply, sequence, Bytes::from(result.into_bytes())),
        Err(code) => {
            let mut payload = TagStruct::new();
            payload.put_u16(code.code());
            Message::control(MessageType::MethodError, sequence, Bytes::from(payload.into_bytes()))
        }
    }
}

fn channel_mode_from_byte(b: u8) -> ChannelMode {
    match b {
        0 => ChannelMode::Read,
        1 => ChannelMode::Write,
        _ => ChannelMode::ReadWrite,
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_message(
    connections: &Mutex<HashMap<u64, Connection>>,
    methods: &MethodTable,
    connection_id: u64,
    token: Token,
    header: &Header,
    payload: &[u8],
    version_policy: VersionPolicy,
    protocol_window: (u16, u16, u16),
    server_name: &str,
    out: &mut Vec<ServerEvent>,
    pending_sends: &mut Vec<(Token, Message)>,
) {
    match header.msg_type {
        MessageType::Hello => {
            let mut conns = connections.lock().expect("server connections mutex poisoned");
            let Some(conn) = conns.get_mut(&connection_id) else { return };
            match conn.state {
                ConnectionState::Authorizing => {
                    let mut tag = TagStruct::from_bytes(payload);
                    let window =
                        tag.get_u16().and_then(|c| Ok((c, tag.get_u16()?, tag.get_u16()?)));
                    match window.ok().and_then(|w| negotiate_version(version_policy, w, protocol_window)) {
                        Some(version) => {
                            conn.protocol_version = version;
                            conn.state = ConnectionState::SettingName;
                            pending_sends.push((token, encode_hello_ack_version(header.sequence, true, version)));
                        }
                        None => {
                            conn.state = ConnectionState::Failed;
                            pending_sends.push((token, encode_hello_ack_version(header.sequence, false, 0)));
                        }
                    }
                }
                ConnectionState::SettingName => {
                    let mut tag = TagStruct::from_bytes(payload);
                    match tag.get_string() {
                        Ok(name) => {
                            conn.peer_name = Some(name);
                            conn.state = ConnectionState::Ready;
                            pending_sends.push((
                                token,
                                encode_hello_ack_name(header.sequence, true, server_name, conn.protocol_version),
                            ));
                        }
                        Err(_) => {
                            conn.state = ConnectionState::Failed;
                            pending_sends.push((token, encode_hello_ack_name(header.sequence, false, "", 0)));
                        }
                    }
                }
                _ => {
                    warn!(connection_id, state = ?conn.state, "unexpected HELLO outside handshake");
                }
            }
        }
        MessageType::MethodCall => {
            let mut args = TagStruct::from_bytes(payload);
            let (Ok(name), Ok(version)) = (args.get_string(), args.get_u16()) else {
                pending_sends.push((token, encode_method_reply(header.sequence, Err(ErrorCode::InvalidMessage))));
                return;
            };
            let call_args = TagStruct::from_bytes(args.remaining_bytes());
            match methods.dispatch(connection_id, header.sequence, &name, version, &call_args) {
                MethodOutcome::Reply(result) => {
                    pending_sends.push((token, encode_method_reply(header.sequence, Ok(result))));
                }
                MethodOutcome::Error(code) => {
                    pending_sends.push((token, encode_method_reply(header.sequence, Err(code))));
                }
                MethodOutcome::Deferred => {}
            }
        }
        MessageType::Subscribe => {
            let mut conns = connections.lock().expect("server connections mutex poisoned");
            if let Some(conn) = conns.get_mut(&connection_id) {
                if let Ok(pattern) = TagStruct::from_bytes(payload).get_string() {
                    conn.subscriptions.subscribe(&pattern);
                }
            }
        }
        MessageType::Unsubscribe => {
            let mut conns = connections.lock().expect("server connections mutex poisoned");
            if let Some(conn) = conns.get_mut(&connection_id) {
                if let Ok(pattern) = TagStruct::from_bytes(payload).get_string() {
                    conn.subscriptions.unsubscribe(&pattern);
                }
            }
        }
        MessageType::ChannelOpen => {
            let mode = channel_mode_from_byte(payload.first().copied().unwrap_or(2));
            let mut conns = connections.lock().expect("server connections mutex poisoned");
            let Some(conn) = conns.get_mut(&connection_id) else { return };
            let mut body = TagStruct::new();
            match conn.channels.open(mode) {
                Some(channel_id) => {
                    body.put_bool(true);
                    body.put_u32(channel_id);
                }
                None => {
                    body.put_bool(false);
                    body.put_u16(ErrorCode::TooManyConns.code());
                }
            }
            let reply = Message::control(MessageType::ChannelOpenReply, header.sequence, Bytes::from(body.into_bytes()));
            pending_sends.push((token, reply));
        }
        MessageType::ChannelClose => {
            let mut conns = connections.lock().expect("server connections mutex poisoned");
            if let Some(conn) = conns.get_mut(&connection_id) {
                conn.channels.close(header.channel_id);
            }
            pending_sends.push((
                token,
                Message::new(
                    MessageType::ChannelCloseReply,
                    header.channel_id,
                    header.sequence,
                    frame::MessageFlags::empty(),
                    Bytes::new(),
                ),
            ));
        }
        MessageType::BinaryData => {
            let mut conns = connections.lock().expect("server connections mutex poisoned");
            let resolved = match conns.get_mut(&connection_id) {
                Some(conn) if header.flags.contains(MessageFlags::HAS_SHM_REF) => decode_shm_ref(payload)
                    .and_then(|(_, remote_id, segment_name, offset, size)| {
                        conn.mem_import.put_from_segment(remote_id, &segment_name, offset as usize, size as usize).ok()
                    })
                    .map(|block| Bytes::copy_from_slice(&block.acquire())),
                Some(_) => Some(Bytes::copy_from_slice(payload)),
                None => None,
            };
            drop(conns);
            match resolved {
                Some(payload) => out.push(ServerEvent::BinaryData {
                    connection_id,
                    channel_id: header.channel_id,
                    sequence: header.sequence,
                    payload,
                }),
                None => warn!(connection_id, "couldn't resolve shm-backed binary data"),
            }
            pending_sends.push((
                token,
                Message::new(
                    MessageType::BinaryAck,
                    header.channel_id,
                    header.sequence,
                    frame::MessageFlags::empty(),
                    Bytes::new(),
                ),
            ));
        }
        MessageType::Ping => {
            pending_sends.push((token, Message::control(MessageType::Pong, header.sequence, Bytes::new())));
        }
        MessageType::MemRelease => {
            let mut conns = connections.lock().expect("server connections mutex poisoned");
            if let (Some(conn), Ok(id)) =
                (conns.get_mut(&connection_id), TagStruct::from_bytes(payload).get_u32())
            {
                let _ = conn.mem_export.release(id);
            }
        }
        MessageType::MemRevoke => {
            let mut conns = connections.lock().expect("server connections mutex poisoned");
            if let (Some(conn), Ok(id)) =
                (conns.get_mut(&connection_id), TagStruct::from_bytes(payload).get_u32())
            {
                let _ = conn.mem_import.revoke(id);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_flag_starts_clear_and_signal_handlers_register_without_error() {
        let server = Server::new(ServerConfig::default(), Arc::new(MethodTable::new()));
        assert!(!server.shutdown_requested());
        server.install_signal_handlers().expect("register signal handlers");
        assert!(!server.shutdown_requested());
    }

    #[test]
    fn default_config_uses_current_protocol_version_everywhere() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.protocol_version_current, frame::PROTOCOL_VERSION);
        assert_eq!(cfg.protocol_version_min, frame::PROTOCOL_VERSION);
        assert_eq!(cfg.protocol_version_max, frame::PROTOCOL_VERSION);
    }

    #[test]
    fn unknown_method_reply_carries_unknown_method_code() {
        let methods = MethodTable::new();
        let mut out = Vec::new();
        let mut pending = Vec::new();
        let connections = Mutex::new(HashMap::from([(1u64, Connection::new(1, Token(0), 4))]));

        let mut args = TagStruct::new();
        args.put_string("does.not.exist");
        args.put_u16(1);
        let header = Header {
            protocol_version: 1,
            payload_version: 1,
            payload_len: args.as_bytes().len() as u32,
            msg_type: MessageType::MethodCall,
            channel_id: 0,
            sequence: 9,
            flags: frame::MessageFlags::empty(),
        };
        handle_message(
            &connections,
            &methods,
            1,
            Token(0),
            &header,
            args.as_bytes(),
            VersionPolicy::Strict,
            (frame::PROTOCOL_VERSION, frame::PROTOCOL_VERSION, frame::PROTOCOL_VERSION),
            "test-server",
            &mut out,
            &mut pending,
        );

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.header.msg_type, MessageType::MethodError);
        let mut reply = TagStruct::from_bytes(&pending[0].1.payload);
        assert_eq!(ErrorCode::from_u16(reply.get_u16().unwrap()), Some(ErrorCode::UnknownMethod));
    }

    #[test]
    fn version_negotiation_and_name_exchange_moves_connection_to_ready() {
        let methods = MethodTable::new();
        let mut out = Vec::new();
        let mut pending = Vec::new();
        let mut conn = Connection::new(1, Token(0), 4);
        conn.state = ConnectionState::Authorizing;
        let connections = Mutex::new(HashMap::from([(1u64, conn)]));

        let mut hello = TagStruct::new();
        hello.put_u16(1);
        hello.put_u16(1);
        hello.put_u16(1);
        let header = Header {
            protocol_version: 1,
            payload_version: 1,
            payload_len: hello.as_bytes().len() as u32,
            msg_type: MessageType::Hello,
            channel_id: 0,
            sequence: 0,
            flags: frame::MessageFlags::empty(),
        };
        handle_message(
            &connections,
            &methods,
            1,
            Token(0),
            &header,
            hello.as_bytes(),
            VersionPolicy::Strict,
            (1, 1, 1),
            "test-server",
            &mut out,
            &mut pending,
        );
        assert_eq!(connections.lock().unwrap().get(&1).unwrap().state, ConnectionState::SettingName);
        let mut first_ack = TagStruct::from_bytes(&pending.pop().unwrap().1.payload);
        assert!(first_ack.get_bool().unwrap());
        assert_eq!(first_ack.get_u16().unwrap(), 1);

        let mut name = TagStruct::new();
        name.put_string("client-one");
        handle_message(
            &connections,
            &methods,
            1,
            Token(0),
            &header,
            name.as_bytes(),
            VersionPolicy::Strict,
            (1, 1, 1),
            "test-server",
            &mut out,
            &mut pending,
        );
        let conns = connections.lock().unwrap();
        let conn = conns.get(&1).unwrap();
        assert_eq!(conn.state, ConnectionState::Ready);
        assert_eq!(conn.peer_name.as_deref(), Some("client-one"));
        let mut second_ack = TagStruct::from_bytes(&pending.pop().unwrap().1.payload);
        assert!(second_ack.get_bool().unwrap());
        assert_eq!(second_ack.get_string().unwrap(), "test-server");
        assert_eq!(second_ack.get_u16().unwrap(), 1);
    }

    #[test]
    fn strict_policy_rejects_mismatched_client_version() {
        assert_eq!(negotiate_version(VersionPolicy::Strict, (2, 1, 2), (1, 1, 1)), None);
    }

    #[test]
    fn compatible_policy_picks_highest_common_version() {
        assert_eq!(negotiate_version(VersionPolicy::Compatible, (3, 1, 3), (1, 2, 2)), Some(2));
    }

    #[test]
    fn permissive_policy_clamps_into_server_range() {
        assert_eq!(negotiate_version(VersionPolicy::Permissive, (5, 1, 5), (1, 1, 2)), Some(2));
    }
}
