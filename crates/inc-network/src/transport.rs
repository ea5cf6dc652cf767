//! Parses the transport URLs a `Context`/`Server` is configured with.
//!
//! Only `tcp://` is wired up to an actual connector in this build — `pipe://`
//! and `unix://` parse successfully (so configuration round-trips and callers
//! can match on the variant) but fail at connect/listen time with
//! `TransportError::Unsupported`.

use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUrl {
    Tcp(SocketAddr),
    Unix(String),
    Pipe(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("couldn't parse transport url {0:?}: {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("transport url {0:?} has no host:port")]
    MissingAddr(String),
    #[error("couldn't resolve {0:?}: {1}")]
    Resolve(String, std::io::Error),
    #[error("transport url {0:?} resolved to no addresses")]
    NoAddr(String),
    #[error("unsupported scheme {0:?}, expected tcp/unix/pipe")]
    UnknownScheme(String),
    #[error("the {0} transport is not implemented by this build")]
    Unsupported(&'static str),
}

impl TransportUrl {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let url = Url::parse(raw).map_err(|e| TransportError::InvalidUrl(raw.to_string(), e))?;
        match url.scheme() {
            "tcp" => {
                let host = url.host_str().ok_or_else(|| TransportError::MissingAddr(raw.to_string()))?;
                let port = url.port().ok_or_else(|| TransportError::MissingAddr(raw.to_string()))?;
                let addr = (host, port)
                    .to_socket_addrs()
                    .map_err(|e| TransportError::Resolve(raw.to_string(), e))?
                    .next()
                    .ok_or_else(|| TransportError::NoAddr(raw.to_string()))?;
                Ok(Self::Tcp(addr))
            }
            "unix" => Ok(Self::Unix(url.path().to_string())),
            "pipe" => Ok(Self::Pipe(url.path().to_string())),
            other => Err(TransportError::UnknownScheme(other.to_string())),
        }
    }

    pub fn as_tcp(&self) -> Result<SocketAddr, TransportError> {
        match self {
            Self::Tcp(addr) => Ok(*addr),
            Self::Unix(_) => Err(TransportError::Unsupported("unix")),
            Self::Pipe(_) => Err(TransportError::Unsupported("pipe")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_url() {
        let url = TransportUrl::parse("tcp://127.0.0.1:9090").unwrap();
        assert_eq!(url, TransportUrl::Tcp(SocketAddr::from(([127, 0, 0, 1], 9090))));
    }

    #[test]
    fn parses_unix_and_pipe_urls_without_connecting() {
        assert_eq!(
            TransportUrl::parse("unix:///tmp/inc.sock").unwrap(),
            TransportUrl::Unix("/tmp/inc.sock".to_string())
        );
        assert_eq!(
            TransportUrl::parse("pipe:///tmp/inc.pipe").unwrap(),
            TransportUrl::Pipe("/tmp/inc.pipe".to_string())
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            TransportUrl::parse("ftp://host/path"),
            Err(TransportError::UnknownScheme(_))
        ));
    }
}
