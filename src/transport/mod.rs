//! Transport layer implementations
//!
//! Provides the raw byte streams tunnel legs run over:
//! - TCP (plain HTTP camouflage)
//! - TLS 1.3/1.2 with browser-like client configuration (HTTPS camouflage)
//!
//! Every stream is boxed as a [`BoxedStream`] so the layers above never care
//! which transport carried a leg.

mod deadline;
mod tcp;

#[cfg(feature = "tls")]
mod tls;

pub use deadline::Deadline;
pub use tcp::TcpDialer;

#[cfg(feature = "tls")]
pub use tls::{build_acceptor, load_certs, load_private_key, TlsDialer};

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::protocol::DEFAULT_DIAL_TIMEOUT;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timeout")]
    Timeout,
}

/// A bidirectional byte stream a leg can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens outbound raw connections for client legs
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` (host:port)
    async fn dial(&self, addr: &str) -> Result<BoxedStream, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on TCP connect plus any TLS handshake
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_DIAL_TIMEOUT,
            nodelay: true,
        }
    }
}

/// Wraps accepted TCP connections before the server reads HTTP from them
#[derive(Clone, Default)]
pub enum Acceptor {
    #[default]
    Plain,
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::TlsAcceptor),
}

impl Acceptor {
    pub async fn accept(&self, stream: TcpStream) -> Result<BoxedStream, TransportError> {
        stream.set_nodelay(true).ok();
        match self {
            Acceptor::Plain => Ok(Box::new(stream)),
            #[cfg(feature = "tls")]
            Acceptor::Tls(acceptor) => {
                let tls = tokio::time::timeout(DEFAULT_DIAL_TIMEOUT, acceptor.accept(stream))
                    .await
                    .map_err(|_| TransportError::Timeout)?
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                Ok(Box::new(tls))
            }
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acceptor::Plain => f.write_str("Plain"),
            #[cfg(feature = "tls")]
            Acceptor::Tls(_) => f.write_str("Tls"),
        }
    }
}
