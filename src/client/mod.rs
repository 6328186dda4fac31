//! Client side of the connection pairing protocol
//!
//! A dial fetches a token from the server's issuance cookie, then opens the
//! upload and download legs concurrently, each carrying the token. The two
//! legs become one [`DuplexConn`] reading the download leg and writing the
//! upload leg.

use crate::config::{CamouflageConfig, ClientConfig};
use crate::http::{drain_body, header_value, read_response_head, HttpError, RequestHead};
use crate::obfuscation::Codec;
use crate::protocol::{
    ProtocolError, Role, CAMOUFLAGE_ENCODING, DEFAULT_DIAL_TIMEOUT, LEG_READ_BUFFER, NO_CACHE,
    WEBSOCKET_VERSION,
};
use crate::transport::{BoxedStream, Dialer, TcpDialer, TransportConfig, TransportError};
use crate::tunnel::DuplexConn;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, Uri};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Tunnel client
#[derive(Clone)]
pub struct Client {
    camouflage: Arc<CamouflageConfig>,
    server: String,
    host: String,
    url_path: String,
    timeout: Duration,
    dialer: Arc<dyn Dialer>,
    codec: Codec,
    user_agent: String,
}

impl Client {
    /// Client for `server` (host:port) over plain TCP
    pub fn new(server: impl Into<String>, camouflage: impl Into<Arc<CamouflageConfig>>) -> Self {
        let server = server.into();
        let camouflage = camouflage.into();
        Self {
            host: server.clone(),
            server,
            url_path: "/".to_string(),
            timeout: DEFAULT_DIAL_TIMEOUT,
            dialer: Arc::new(TcpDialer::default()),
            codec: Codec::for_client(&camouflage),
            user_agent: camouflage.user_agent(),
            camouflage,
        }
    }

    /// Client from configuration, dialing over TLS if configured
    pub fn from_config(
        config: &ClientConfig,
        camouflage: &CamouflageConfig,
    ) -> crate::Result<Self> {
        let transport = TransportConfig {
            connect_timeout: config.timeout(),
            ..TransportConfig::default()
        };
        let dialer: Arc<dyn Dialer> = if config.tls {
            tls_dialer(config, camouflage, transport)?
        } else {
            Arc::new(TcpDialer::new(transport))
        };

        let client = Self::new(config.server.clone(), camouflage.clone())
            .with_dialer(dialer)
            .with_timeout(config.timeout())
            .with_url_path(config.url_path.clone());
        Ok(match &config.host {
            Some(host) => client.with_host(host.clone()),
            None => client,
        })
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Bound on the token fetch and on each leg
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `Host` header value
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_url_path(mut self, path: impl Into<String>) -> Self {
        self.url_path = path.into();
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Open a tunnel
    pub async fn dial(&self) -> crate::Result<DuplexConn> {
        let token = self.fetch_token().await?;
        debug!("dialing {} with token {}", self.server, token);

        let (upload, download) = tokio::join!(
            self.timed_leg(Role::Upload, &token),
            self.timed_leg(Role::Download, &token),
        );
        let ((upload, _), (download, buffered)) = match (upload, download) {
            (Ok(upload), Ok(download)) => (upload, download),
            (Err(e), Ok((mut sibling, _))) | (Ok((mut sibling, _)), Err(e)) => {
                sibling.shutdown().await.ok();
                return Err(e);
            }
            (Err(e), Err(_)) => return Err(e),
        };

        Ok(DuplexConn::compose(download, upload, buffered, &self.codec))
    }

    /// Fetch a fresh token from the issuance cookie of an ordinary request
    pub async fn fetch_token(&self) -> crate::Result<String> {
        tokio::time::timeout(self.timeout, self.request_token())
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn request_token(&self) -> crate::Result<String> {
        let conn = self.dialer.dial(&self.server).await?;
        let mut reader = BufReader::new(conn);

        let request = RequestHead::new(Method::GET, self.uri()?)
            .with_header(header::HOST, header_value(&self.host)?)
            .with_header(header::USER_AGENT, header_value(&self.user_agent)?)
            .with_header(header::ACCEPT, HeaderValue::from_static(ACCEPT_HTML))
            .with_header(header::CONNECTION, HeaderValue::from_static("close"));
        write_request(reader.get_mut(), &request).await?;

        let response = read_response_head(&mut reader).await?;
        let token = response
            .set_cookie(&self.camouflage.issue_cookie)
            .map(str::to_string)
            .ok_or(ProtocolError::NotServer)?;
        let skipped = drain_body(&mut reader, response.body_length()?).await?;
        trace!("token response {} with {} body bytes", response.status, skipped);

        reader.get_mut().shutdown().await.ok();
        Ok(token)
    }

    async fn timed_leg(&self, role: Role, token: &str) -> crate::Result<(BoxedStream, Bytes)> {
        match tokio::time::timeout(self.timeout, self.open_leg(role, token)).await {
            Ok(Ok(leg)) => Ok(leg),
            Ok(Err(e)) => {
                debug!("{} leg failed: {}", role, e);
                Err(e)
            }
            Err(_) => {
                debug!("{} leg timed out", role);
                Err(TransportError::Timeout.into())
            }
        }
    }

    /// Send one leg's request and return the raw stream plus any bytes read
    /// past the response head
    async fn open_leg(&self, role: Role, token: &str) -> crate::Result<(BoxedStream, Bytes)> {
        let conn = self.dialer.dial(&self.server).await?;
        let mut reader = BufReader::with_capacity(LEG_READ_BUFFER, conn);
        let request = self.leg_request(role, token)?;
        write_request(reader.get_mut(), &request).await?;

        let response = read_response_head(&mut reader).await?;
        if response.set_cookie(&self.camouflage.issue_cookie).is_some() {
            // Answered as a decoy
            reader.into_inner().shutdown().await.ok();
            return Err(ProtocolError::TokenTimeout.into());
        }
        trace!("{} leg open: {}", role, response.status);

        let buffered = Bytes::copy_from_slice(reader.buffer());
        Ok((reader.into_inner(), buffered))
    }

    fn uri(&self) -> Result<Uri, HttpError> {
        self.url_path
            .parse()
            .map_err(|e| http::Error::from(e).into())
    }

    fn leg_request(&self, role: Role, token: &str) -> Result<RequestHead, HttpError> {
        let camouflage = &self.camouflage;
        let method =
            Method::from_bytes(camouflage.method(role).as_bytes()).map_err(http::Error::from)?;
        let cookie = format!(
            "{}={}; {}={}",
            camouflage.token_cookie,
            token,
            camouflage.role_cookie,
            camouflage.flag(role)
        );
        let mut head = RequestHead::new(method, self.uri()?)
            .with_header(header::HOST, header_value(&self.host)?)
            .with_header(header::USER_AGENT, header_value(&self.user_agent)?)
            .with_header(header::PRAGMA, HeaderValue::from_static("no-cache"))
            .with_header(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE))
            .with_header(header::COOKIE, header_value(cookie)?);

        if role == Role::Upload {
            head = head
                .with_header(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                )
                .with_header(
                    header::CONTENT_ENCODING,
                    HeaderValue::from_static(CAMOUFLAGE_ENCODING),
                );
        }
        if camouflage.websocket {
            head = head
                .with_header(header::CONNECTION, HeaderValue::from_static("Upgrade"))
                .with_header(header::UPGRADE, HeaderValue::from_static("websocket"))
                .with_header(header::SEC_WEBSOCKET_KEY, header_value(token)?)
                .with_header(
                    header::SEC_WEBSOCKET_VERSION,
                    HeaderValue::from_static(WEBSOCKET_VERSION),
                );
        }
        Ok(head)
    }
}

async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    head: &RequestHead,
) -> std::io::Result<()> {
    writer.write_all(&head.encode()).await?;
    writer.flush().await
}

#[cfg(feature = "tls")]
fn tls_dialer(
    config: &ClientConfig,
    camouflage: &CamouflageConfig,
    transport: TransportConfig,
) -> crate::Result<Arc<dyn Dialer>> {
    use crate::obfuscation::{build_tls_config, RootTrust};
    use crate::transport::TlsDialer;

    let trust = match (&config.tls_ca, config.tls_insecure) {
        (_, true) => RootTrust::Insecure,
        (Some(ca), false) => RootTrust::Pinned(ca.into()),
        (None, false) => RootTrust::WebPki,
    };
    let tls_config = build_tls_config(camouflage.browser_profile, &trust)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let sni = config
        .tls_sni
        .clone()
        .unwrap_or_else(|| config.server_host().to_string());
    Ok(Arc::new(TlsDialer::new(transport, tls_config, sni)?))
}

#[cfg(not(feature = "tls"))]
fn tls_dialer(
    _config: &ClientConfig,
    _camouflage: &CamouflageConfig,
    _transport: TransportConfig,
) -> crate::Result<Arc<dyn Dialer>> {
    Err(crate::Error::Config(
        "tls requested but built without the tls feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve `response` to one connection after reading its request head
    async fn one_shot(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_leg_request_headers() {
        let client = Client::new("example.com:80", CamouflageConfig::default());

        let upload = client.leg_request(Role::Upload, "tok").unwrap();
        assert_eq!(upload.method, Method::POST);
        assert_eq!(upload.cookie("_tb_token_"), Some("tok"));
        assert_eq!(upload.cookie("_cna"), Some("0"));
        assert_eq!(upload.header("Content-Encoding"), Some("gzip"));
        assert_eq!(upload.header("Host"), Some("example.com:80"));
        assert_eq!(upload.header("Upgrade"), None);

        let download = client.leg_request(Role::Download, "tok").unwrap();
        assert_eq!(download.method, Method::GET);
        assert_eq!(download.cookie("_cna"), Some("1"));
        assert_eq!(download.header("Content-Type"), None);
        assert_eq!(download.header("Pragma"), Some("no-cache"));
    }

    #[test]
    fn test_websocket_leg_request() {
        let camouflage = CamouflageConfig {
            websocket: true,
            ..CamouflageConfig::default()
        };
        let client = Client::new("example.com:80", camouflage).with_host("cdn.example.com");
        let head = client.leg_request(Role::Download, "tok").unwrap();
        assert_eq!(head.header("Sec-WebSocket-Key"), Some("tok"));
        assert_eq!(head.header("Sec-WebSocket-Version"), Some("13"));
        assert_eq!(head.header("Host"), Some("cdn.example.com"));
    }

    #[tokio::test]
    async fn test_fetch_token() {
        let addr = one_shot(
            "HTTP/1.1 200 OK\r\nSet-Cookie: cna=abc123; Expires=Thu, 01 Jan 2099 00:00:00 GMT\r\n\
             Transfer-Encoding: chunked\r\n\r\n4\r\nbody\r\n0\r\n\r\n",
        )
        .await;
        let client = Client::new(addr, CamouflageConfig::default());
        assert_eq!(client.fetch_token().await.unwrap(), "abc123");
    }

    #[tokio::test]
    async fn test_fetch_token_not_server() {
        let addr = one_shot("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
        let client = Client::new(addr, CamouflageConfig::default());
        let err = client.fetch_token().await.unwrap_err();
        assert!(matches!(err.protocol(), Some(ProtocolError::NotServer)));
    }

    #[tokio::test]
    async fn test_fetch_token_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Accepts but never answers
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let client =
            Client::new(addr, CamouflageConfig::default()).with_timeout(Duration::from_millis(100));
        let err = client.fetch_token().await.unwrap_err();
        assert!(matches!(err, crate::Error::Transport(TransportError::Timeout)));
    }

    #[test]
    fn test_from_config_plain() {
        let config = ClientConfig {
            server: "10.0.0.1:8080".to_string(),
            host: Some("www.example.com".to_string()),
            url_path: "/api".to_string(),
            ..ClientConfig::default()
        };
        let client = Client::from_config(&config, &CamouflageConfig::default()).unwrap();
        assert_eq!(client.server(), "10.0.0.1:8080");
        let head = client.leg_request(Role::Upload, "t").unwrap();
        assert_eq!(head.path(), "/api");
        assert_eq!(head.header("Host"), Some("www.example.com"));
    }
}
