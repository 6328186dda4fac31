//! Raw TCP transport

use super::{BoxedStream, Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use tokio::net::TcpStream;

/// Raw TCP dialer
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TransportConfig,
}

impl TcpDialer {
    /// Create a new TCP dialer
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Connect without boxing, for callers that need the concrete stream
    pub async fn connect(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        // Configure TCP options
        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, TransportError> {
        Ok(Box::new(self.connect(addr).await?))
    }
}
