//! # httptun
//!
//! A duplex byte-stream tunnel disguised as ordinary HTTP traffic, optionally
//! dressed up as a WebSocket upgrade and optionally wrapped in TLS.
//!
//! A client opens two independent HTTP requests, one carrying the upload
//! direction and one carrying the download direction. The server recognises
//! both by a short-lived session token carried in cookies, takes over the raw
//! connections beneath its HTTP layer and splices them into a single duplex
//! stream. Requests that do not carry a valid token are answered with decoy
//! web content, so a passive observer only ever sees plausible web requests.
//!
//! ## Features
//!
//! - **Two-leg pairing** of unrelated connections by session token
//! - **Decoy web content** for every request that is not a tunnel leg
//! - **WebSocket camouflage** (a masquerade of the upgrade handshake)
//! - **Length hiding** with chunked transfer coding and padding frames
//! - **Optional TLS** with browser-like client configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │        (relay to a target / local listener)          │
//! ├─────────────────────────────────────────────────────┤
//! │               Connection Pairing Layer               │
//! │    (server router + token registry, client dial)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Duplex Stream Layer                  │
//! │     (input leg + output leg + hijacked bytes)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 Obfuscation Layer                    │
//! │         (chunked coding, padding frames)             │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                  (TCP, TLS 1.3)                      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod http;
pub mod obfuscation;
pub mod protocol;
pub mod server;
pub mod token;
pub mod transport;
pub mod tunnel;

pub use client::Client;
pub use config::Config;
pub use server::{Server, ServerOptions};
pub use tunnel::DuplexConn;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::HttpError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// The protocol-level error kind, if this is one.
    pub fn protocol(&self) -> Option<&protocol::ProtocolError> {
        match self {
            Error::Protocol(e) => Some(e),
            _ => None,
        }
    }
}
