//! Protocol definitions and constants

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer's response carried none of the expected tunnel cookies
    #[error("peer may not be a tunnel server")]
    NotServer,

    /// The token was accepted at issuance but rejected by the time a leg arrived
    #[error("token may have timed out")]
    TokenTimeout,

    /// Token is unknown to the registry or has expired
    #[error("token not found")]
    TokenNotFound,

    /// The server or its accept queue was shut down
    #[error("server closed")]
    ServerClose,
}

/// The two legs of a tunnel, named from the client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Client to server direction
    Upload,
    /// Server to client direction
    Download,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Upload => f.write_str("upload"),
            Role::Download => f.write_str("download"),
        }
    }
}

/// Default session token length
pub const DEFAULT_TOKEN_LEN: usize = 16;

/// Default token time-to-live
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30);

/// Interval between expired-token sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Lifetime advertised on the issuance cookie
pub const ISSUANCE_COOKIE_DAYS: i64 = 3;

/// Capacity of the server's accept queue
pub const ACCEPT_BACKLOG: usize = 128;

/// Idle time allowed between requests on a decoy keep-alive connection
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default connect/handshake timeout for each client leg
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer used by the client when parsing a leg's handshake response
pub const LEG_READ_BUFFER: usize = 1024;

/// `Cache-Control` value sent on tunnel legs
pub const NO_CACHE: &str = "private, no-store, no-cache, max-age=0";

/// `Content-Encoding` marker; purely camouflage, nothing is compressed
pub const CAMOUFLAGE_ENCODING: &str = "gzip";

/// `Sec-WebSocket-Version` sent in WebSocket camouflage mode
pub const WEBSOCKET_VERSION: &str = "13";

pub const DEFAULT_UPLOAD_METHOD: &str = "POST";
pub const DEFAULT_DOWNLOAD_METHOD: &str = "GET";
pub const DEFAULT_UPLOAD_FLAG: &str = "0";
pub const DEFAULT_DOWNLOAD_FLAG: &str = "1";
pub const DEFAULT_ISSUE_COOKIE: &str = "cna";
pub const DEFAULT_TOKEN_COOKIE: &str = "_tb_token_";
pub const DEFAULT_ROLE_COOKIE: &str = "_cna";
pub const DEFAULT_SERVER_HEADER: &str = "nginx";
