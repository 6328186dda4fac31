//! Configuration management

use crate::obfuscation::{BrowserProfile, Framing, PaddingConfig};
use crate::protocol::{self, Role};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Camouflage shared by both peers
    #[serde(default)]
    pub camouflage: CamouflageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check values that parse but cannot work
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.camouflage.validate()?;
        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(client) = &self.client {
            client.validate()?;
        }
        Ok(())
    }
}

/// How tunnel legs are disguised. Both peers must use the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CamouflageConfig {
    /// HTTP method of the upload leg
    pub upload_method: String,
    /// HTTP method of the download leg
    pub download_method: String,
    /// Role cookie value marking the upload leg
    pub upload_flag: String,
    /// Role cookie value marking the download leg
    pub download_flag: String,
    /// Cookie the server issues new tokens in
    pub issue_cookie: String,
    /// Cookie the client carries its token in
    pub token_cookie: String,
    /// Cookie carrying the role flag
    pub role_cookie: String,
    /// `Server` header on every response
    pub server_header: String,
    /// Browser the client impersonates
    pub browser_profile: BrowserProfile,
    /// Overrides the profile's User-Agent
    pub user_agent: Option<String>,
    /// Masquerade legs as a WebSocket upgrade
    pub websocket: bool,
    /// Length of issued session tokens
    pub token_len: usize,
    /// Framing of client-to-server bytes
    pub upload_framing: Framing,
    /// Framing of server-to-client bytes
    pub download_framing: Framing,
    /// Frame sizing for padded directions
    pub padding: PaddingConfig,
}

impl Default for CamouflageConfig {
    fn default() -> Self {
        Self {
            upload_method: protocol::DEFAULT_UPLOAD_METHOD.to_string(),
            download_method: protocol::DEFAULT_DOWNLOAD_METHOD.to_string(),
            upload_flag: protocol::DEFAULT_UPLOAD_FLAG.to_string(),
            download_flag: protocol::DEFAULT_DOWNLOAD_FLAG.to_string(),
            issue_cookie: protocol::DEFAULT_ISSUE_COOKIE.to_string(),
            token_cookie: protocol::DEFAULT_TOKEN_COOKIE.to_string(),
            role_cookie: protocol::DEFAULT_ROLE_COOKIE.to_string(),
            server_header: protocol::DEFAULT_SERVER_HEADER.to_string(),
            browser_profile: BrowserProfile::default(),
            user_agent: None,
            websocket: false,
            token_len: protocol::DEFAULT_TOKEN_LEN,
            upload_framing: Framing::Raw,
            download_framing: Framing::Raw,
            padding: PaddingConfig::default(),
        }
    }
}

impl CamouflageConfig {
    /// User-Agent sent on every client request
    pub fn user_agent(&self) -> String {
        match &self.user_agent {
            Some(ua) => ua.clone(),
            None => self.browser_profile.user_agent().to_string(),
        }
    }

    /// HTTP method of a leg
    pub fn method(&self, role: Role) -> &str {
        match role {
            Role::Upload => &self.upload_method,
            Role::Download => &self.download_method,
        }
    }

    /// Role cookie value of a leg
    pub fn flag(&self, role: Role) -> &str {
        match role {
            Role::Upload => &self.upload_flag,
            Role::Download => &self.download_flag,
        }
    }

    /// The role whose method and flag both match, if any
    pub fn role_for(&self, method: &str, flag: &str) -> Option<Role> {
        [Role::Upload, Role::Download]
            .into_iter()
            .find(|&role| self.method(role).eq_ignore_ascii_case(method) && self.flag(role) == flag)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        let cookies = [&self.issue_cookie, &self.token_cookie, &self.role_cookie];
        if cookies.iter().any(|c| c.is_empty() || !is_token(c)) {
            return Err(crate::Error::Config(
                "cookie names must be non-empty HTTP tokens".to_string(),
            ));
        }
        if cookies[0] == cookies[1] || cookies[0] == cookies[2] || cookies[1] == cookies[2] {
            return Err(crate::Error::Config("cookie names must be distinct".to_string()));
        }
        if !is_token(&self.upload_method) || !is_token(&self.download_method) {
            return Err(crate::Error::Config("invalid HTTP method".to_string()));
        }
        if self.upload_method.eq_ignore_ascii_case(&self.download_method)
            && self.upload_flag == self.download_flag
        {
            return Err(crate::Error::Config(
                "upload and download legs must differ in method or flag".to_string(),
            ));
        }
        if self.token_len == 0 {
            return Err(crate::Error::Config("token_len must be positive".to_string()));
        }
        let header_texts = [Some(&self.server_header), self.user_agent.as_ref()];
        if header_texts
            .into_iter()
            .flatten()
            .any(|text| http::HeaderValue::from_str(text).is_err())
        {
            return Err(crate::Error::Config(
                "server_header and user_agent must be valid header values".to_string(),
            ));
        }
        self.padding.validate().map_err(crate::Error::Config)
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Address every accepted tunnel is relayed to
    pub target: String,
    /// Directory served to decoy requests
    pub decoy_dir: Option<String>,
    /// TLS certificate path
    pub tls_cert: Option<String>,
    /// TLS key path
    pub tls_key: Option<String>,
    /// Seconds a token waits for both legs
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Seconds between expired-token sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum concurrent relayed tunnels
    pub max_connections: usize,
}

fn default_token_ttl_secs() -> u64 {
    protocol::DEFAULT_TOKEN_TTL.as_secs()
}

fn default_sweep_interval_secs() -> u64 {
    protocol::DEFAULT_SWEEP_INTERVAL.as_secs()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:80".to_string(),
            target: "127.0.0.1:22".to_string(),
            decoy_dir: None,
            tls_cert: None,
            tls_key: None,
            token_ttl_secs: default_token_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.token_ttl_secs == 0 {
            return Err(crate::Error::Config("token_ttl_secs must be positive".to_string()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(crate::Error::Config(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err(crate::Error::Config(
                "tls_cert and tls_key must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local address accepting connections to tunnel
    pub listen: String,
    /// Tunnel server address (host:port)
    pub server: String,
    /// `Host` header; defaults to the server address
    pub host: Option<String>,
    /// Path requested on every leg
    #[serde(default = "default_url_path")]
    pub url_path: String,
    /// Connect and handshake timeout per leg, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Wrap legs in TLS
    #[serde(default)]
    pub tls: bool,
    /// TLS SNI to use (defaults to the server host)
    pub tls_sni: Option<String>,
    /// PEM file of the CA to trust instead of the web PKI roots
    pub tls_ca: Option<String>,
    /// Skip server certificate verification
    #[serde(default)]
    pub tls_insecure: bool,
}

fn default_url_path() -> String {
    "/".to_string()
}

fn default_timeout_secs() -> u64 {
    protocol::DEFAULT_DIAL_TIMEOUT.as_secs()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:2222".to_string(),
            server: "127.0.0.1:80".to_string(),
            host: None,
            url_path: default_url_path(),
            timeout_secs: default_timeout_secs(),
            tls: false,
            tls_sni: None,
            tls_ca: None,
            tls_insecure: false,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Host part of the server address
    pub fn server_host(&self) -> &str {
        match self.server.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.server,
        }
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if !self.url_path.starts_with('/') {
            return Err(crate::Error::Config("url_path must start with '/'".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(crate::Error::Config("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        camouflage: CamouflageConfig::default(),
        logging: LoggingConfig::default(),
    }
}
