//! TLS transport
//!
//! Client legs use a [`TlsDialer`] built from a browser-like
//! `rustls::ClientConfig`; the server wraps accepted sockets with an acceptor
//! loaded from PEM files.

use super::{BoxedStream, Dialer, TcpDialer, TransportConfig, TransportError};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

/// TLS dialer
#[derive(Clone)]
pub struct TlsDialer {
    tcp: TcpDialer,
    config: TransportConfig,
    connector: TlsConnector,
    sni: ServerName<'static>,
}

impl TlsDialer {
    /// Create a dialer presenting `sni` in the ClientHello
    pub fn new(
        config: TransportConfig,
        tls_config: rustls::ClientConfig,
        sni: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let sni = sni.into();
        let sni = ServerName::try_from(sni.clone())
            .map_err(|e| TransportError::Tls(format!("Invalid SNI {}: {}", sni, e)))?;

        Ok(Self {
            tcp: TcpDialer::new(config.clone()),
            config,
            connector: TlsConnector::from(Arc::new(tls_config)),
            sni,
        })
    }

    /// Get the SNI being used
    pub fn sni(&self) -> &ServerName<'static> {
        &self.sni
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, TransportError> {
        let tcp_stream = self.tcp.connect(addr).await?;

        let tls_stream = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(self.sni.clone(), tcp_stream),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Box::new(tls_stream))
    }
}

/// Load TLS certificate chain from PEM file
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let path = path.as_ref();
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(|e| {
        TransportError::Tls(format!("Failed to open cert file {}: {}", path.display(), e))
    })?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    info!("Loaded {} certificate(s) from {}", certs.len(), path.display());
    Ok(certs)
}

/// Load TLS private key from PEM file
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, TransportError> {
    let path = path.as_ref();
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(|e| {
        TransportError::Tls(format!("Failed to open key file {}: {}", path.display(), e))
    })?);
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| TransportError::Tls(format!("No private key found in {}", path.display())))
}

/// Build the server-side acceptor from PEM certificate chain and key
pub fn build_acceptor(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
