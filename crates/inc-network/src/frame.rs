//! Wire format for the fabric: a fixed 24-byte header followed by an
//! opaque payload. All multi-byte header fields are big-endian. This is
//! the framing every transport (`tcp`, eventually `unix`/`pipe`) reads and
//! writes; message semantics (handshake, method dispatch, ...) live in
//! `engine`.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// `b"INC\0"` read as a big-endian u32, distinguishes our frames from a
/// stray client speaking something else on the same port.
pub const MAGIC: u32 = 0x494E_4300;
pub const HEADER_SIZE: usize = 24;
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Invalid = 0,
    Hello = 1,
    HelloAck = 2,
    MethodCall = 3,
    MethodReply = 4,
    MethodError = 5,
    Event = 6,
    Subscribe = 7,
    Unsubscribe = 8,
    ChannelOpen = 9,
    ChannelOpenReply = 10,
    ChannelClose = 11,
    ChannelCloseReply = 12,
    BinaryData = 13,
    BinaryAck = 14,
    Ping = 15,
    Pong = 16,
    MemRelease = 17,
    MemRevoke = 18,
}

impl MessageType {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Invalid,
            1 => Self::Hello,
            2 => Self::HelloAck,
            3 => Self::MethodCall,
            4 => Self::MethodReply,
            5 => Self::MethodError,
            6 => Self::Event,
            7 => Self::Subscribe,
            8 => Self::Unsubscribe,
            9 => Self::ChannelOpen,
            10 => Self::ChannelOpenReply,
            11 => Self::ChannelClose,
            12 => Self::ChannelCloseReply,
            13 => Self::BinaryData,
            14 => Self::BinaryAck,
            15 => Self::Ping,
            16 => Self::Pong,
            17 => Self::MemRelease,
            18 => Self::MemRevoke,
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u16 {
        const HAS_SHM_REF = 0b0000_0001;
    }
}

/// Upper 4 bits of an [`ErrorCode`] select the category; the remaining 12
/// bits are the code within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    Protocol,
    Resource,
    Application,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    #[error("connection failed")]
    ConnectionFailed = 0x8001,
    #[error("disconnected")]
    Disconnected = 0x8002,
    #[error("timed out")]
    Timeout = 0x8003,
    #[error("authentication failed")]
    AuthFailed = 0x8004,
    #[error("protocol version mismatch")]
    ProtocolMismatch = 0x8005,
    #[error("handshake failed")]
    HandshakeFailed = 0x8006,
    #[error("not connected")]
    NotConnected = 0x8007,
    #[error("already connected")]
    AlreadyConnected = 0x8008,
    #[error("channel error")]
    Channel = 0x8009,

    #[error("invalid message")]
    InvalidMessage = 0xC001,
    #[error("protocol error")]
    ProtocolError = 0xC002,
    #[error("unknown method")]
    UnknownMethod = 0xC003,
    #[error("invalid arguments")]
    InvalidArgs = 0xC004,
    #[error("sequence error")]
    SequenceError = 0xC005,
    #[error("message too large")]
    MessageTooLarge = 0xC006,
    #[error("write failed")]
    WriteFailed = 0xC007,
    #[error("invalid state for this message")]
    InvalidState = 0xC008,

    #[error("out of memory")]
    NoMemory = 0xE001,
    #[error("too many connections")]
    TooManyConns = 0xE002,
    #[error("stream failed")]
    StreamFailed = 0xE003,
    #[error("queue full")]
    QueueFull = 0xE004,
    #[error("resource unavailable")]
    ResourceUnavailable = 0xE005,
    #[error("access denied")]
    AccessDenied = 0xE006,
    #[error("not subscribed")]
    NotSubscribed = 0xE007,

    #[error("internal error")]
    Internal = 0xF001,
    #[error("unknown error")]
    Unknown = 0xF002,
    #[error("application error")]
    Application = 0xF003,
}

impl ErrorCode {
    pub fn category(self) -> ErrorCategory {
        match (self as u16) >> 12 {
            0x8 => ErrorCategory::Connection,
            0xC => ErrorCategory::Protocol,
            0xE => ErrorCategory::Resource,
            0xF => ErrorCategory::Application,
            _ => ErrorCategory::Application,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x8001 => Self::ConnectionFailed,
            0x8002 => Self::Disconnected,
            0x8003 => Self::Timeout,
            0x8004 => Self::AuthFailed,
            0x8005 => Self::ProtocolMismatch,
            0x8006 => Self::HandshakeFailed,
            0x8007 => Self::NotConnected,
            0x8008 => Self::AlreadyConnected,
            0x8009 => Self::Channel,
            0xC001 => Self::InvalidMessage,
            0xC002 => Self::ProtocolError,
            0xC003 => Self::UnknownMethod,
            0xC004 => Self::InvalidArgs,
            0xC005 => Self::SequenceError,
            0xC006 => Self::MessageTooLarge,
            0xC007 => Self::WriteFailed,
            0xC008 => Self::InvalidState,
            0xE001 => Self::NoMemory,
            0xE002 => Self::TooManyConns,
            0xE003 => Self::StreamFailed,
            0xE004 => Self::QueueFull,
            0xE005 => Self::ResourceUnavailable,
            0xE006 => Self::AccessDenied,
            0xE007 => Self::NotSubscribed,
            0xF001 => Self::Internal,
            0xF002 => Self::Unknown,
            0xF003 => Self::Application,
            _ => return None,
        })
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("short header: need {HEADER_SIZE} bytes")]
    ShortHeader,
    #[error("bad magic {0:#x}")]
    BadMagic(u32),
    #[error("unknown message type {0}")]
    UnknownType(u16),
    #[error("payload length {0} exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol_version: u16,
    pub payload_version: u16,
    pub payload_len: u32,
    pub msg_type: MessageType,
    pub channel_id: u32,
    pub sequence: u32,
    pub flags: MessageFlags,
}

impl Header {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(MAGIC);
        buf.put_u16(self.protocol_version);
        buf.put_u16(self.payload_version);
        buf.put_u32(self.payload_len);
        buf.put_u16(self.msg_type as u16);
        buf.put_u32(self.channel_id);
        buf.put_u32(self.sequence);
        buf.put_u16(self.flags.bits());
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::ShortHeader);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let protocol_version = buf.get_u16();
        let payload_version = buf.get_u16();
        let payload_len = buf.get_u32();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        let raw_type = buf.get_u16();
        let msg_type = MessageType::from_u16(raw_type).ok_or(FrameError::UnknownType(raw_type))?;
        let channel_id = buf.get_u32();
        let sequence = buf.get_u32();
        let flags = MessageFlags::from_bits_truncate(buf.get_u16());
        Ok(Self { protocol_version, payload_version, payload_len, msg_type, channel_id, sequence, flags })
    }
}

/// A complete frame: header plus its payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Bytes,
}

impl Message {
    pub fn new(
        msg_type: MessageType,
        channel_id: u32,
        sequence: u32,
        flags: MessageFlags,
        payload: Bytes,
    ) -> Self {
        Self {
            header: Header {
                protocol_version: PROTOCOL_VERSION,
                payload_version: PAYLOAD_VERSION,
                payload_len: payload.len() as u32,
                msg_type,
                channel_id,
                sequence,
                flags,
            },
            payload,
        }
    }

    pub fn control(msg_type: MessageType, sequence: u32, payload: Bytes) -> Self {
        Self::new(msg_type, 0, sequence, MessageFlags::empty(), payload)
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        self.header.encode(buf);
        buf.put_slice(&self.payload);
    }
}

pub const PROTOCOL_VERSION: u16 = 1;
pub const PAYLOAD_VERSION: u16 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_encode_decode() {
        let mut buf = BytesMut::new();
        let msg = Message::new(
            MessageType::MethodCall,
            3,
            42,
            MessageFlags::HAS_SHM_REF,
            Bytes::from_static(b"hello"),
        );
        msg.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE + 5);

        let decoded = Header::decode(&buf[..HEADER_SIZE]).unwrap();
        assert_eq!(decoded.msg_type, MessageType::MethodCall);
        assert_eq!(decoded.channel_id, 3);
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.payload_len, 5);
        assert!(decoded.flags.contains(MessageFlags::HAS_SHM_REF));
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let buf = [0xFFu8; HEADER_SIZE];
        assert_eq!(Header::decode(&buf), Err(FrameError::BadMagic(0xFFFF_FFFF)));
    }

    #[test]
    fn decode_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u16(1);
        buf.put_u16(1);
        buf.put_u32(MAX_PAYLOAD_LEN + 1);
        buf.put_u16(MessageType::Ping as u16);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u16(0);
        assert_eq!(Header::decode(&buf), Err(FrameError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1)));
    }

    #[test]
    fn error_code_category_matches_its_nibble() {
        assert_eq!(ErrorCode::Timeout.category(), ErrorCategory::Connection);
        assert_eq!(ErrorCode::UnknownMethod.category(), ErrorCategory::Protocol);
        assert_eq!(ErrorCode::QueueFull.category(), ErrorCategory::Resource);
        assert_eq!(ErrorCode::Internal.category(), ErrorCategory::Application);
    }

    #[test]
    fn error_code_from_u16_round_trips_every_variant() {
        let codes = [
            ErrorCode::ConnectionFailed,
            ErrorCode::Disconnected,
            ErrorCode::Timeout,
            ErrorCode::AuthFailed,
            ErrorCode::ProtocolMismatch,
            ErrorCode::HandshakeFailed,
            ErrorCode::NotConnected,
            ErrorCode::AlreadyConnected,
            ErrorCode::Channel,
            ErrorCode::InvalidMessage,
            ErrorCode::ProtocolError,
            ErrorCode::UnknownMethod,
            ErrorCode::InvalidArgs,
            ErrorCode::SequenceError,
            ErrorCode::MessageTooLarge,
            ErrorCode::WriteFailed,
            ErrorCode::InvalidState,
            ErrorCode::NoMemory,
            ErrorCode::TooManyConns,
            ErrorCode::StreamFailed,
            ErrorCode::QueueFull,
            ErrorCode::ResourceUnavailable,
            ErrorCode::AccessDenied,
            ErrorCode::NotSubscribed,
            ErrorCode::Internal,
            ErrorCode::Unknown,
            ErrorCode::Application,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_u16(code.code()), Some(code));
        }
        assert_eq!(ErrorCode::from_u16(0x0000), None);
    }
}
