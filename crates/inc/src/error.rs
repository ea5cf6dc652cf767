//! Top-level error type returned by `Context`/`Server`/`Stream` APIs. Wraps
//! the wire-level [`ErrorCode`] taxonomy plus the lower crates' errors so
//! callers get a single `Result<T, IncError>` regardless of which layer
//! failed.

use inc_communication::{PoolError, TagError};
use inc_network::frame::{ErrorCode, FrameError};
use inc_network::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IncError {
    #[error("{0}")]
    Protocol(ErrorCode),
    #[error("tag error: {0}")]
    Tag(#[from] TagError),
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("operation timed out")]
    TimedOut,
    #[error("not connected")]
    NotConnected,
}

impl From<ErrorCode> for IncError {
    fn from(code: ErrorCode) -> Self {
        Self::Protocol(code)
    }
}

impl IncError {
    /// Maps this error onto a wire [`ErrorCode`] for sending back to a peer.
    /// Errors with no natural wire representation collapse to `INTERNAL`.
    pub fn as_error_code(&self) -> ErrorCode {
        match self {
            Self::Protocol(code) => *code,
            Self::Tag(_) => ErrorCode::InvalidMessage,
            Self::Pool(_) => ErrorCode::NoMemory,
            Self::Transport(_) => ErrorCode::ConnectionFailed,
            Self::Frame(_) => ErrorCode::InvalidMessage,
            Self::Io(_) => ErrorCode::ConnectionFailed,
            Self::Cancelled => ErrorCode::Disconnected,
            Self::TimedOut => ErrorCode::Timeout,
            Self::NotConnected => ErrorCode::NotConnected,
        }
    }
}
