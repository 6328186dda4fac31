//! Server side of the connection pairing protocol
//!
//! Every accepted connection runs an HTTP/1.1 loop. Requests that are not
//! tunnel legs get decoy content plus a fresh token. A leg gets a camouflage
//! response head, after which the raw stream is taken out from under the
//! HTTP layer and parked in its token's pairing state. Whichever leg
//! completes the pair composes the [`DuplexConn`] and queues it for
//! [`Server::accept`].

mod decoy;
mod router;

pub use decoy::{DecoyHandler, DecoyResponse, FixedPage, StaticSite};
pub use router::{classify, takeover_head, DecoyReason, Route};

use crate::config::CamouflageConfig;
use crate::http::{
    drain_body, header_value, read_request_head, set_cookie_value, HttpError, RequestHead,
    ResponseHead,
};
use crate::obfuscation::Codec;
use crate::protocol::{
    ProtocolError, Role, ACCEPT_BACKLOG, DEFAULT_SWEEP_INTERVAL, ISSUANCE_COOKIE_DAYS,
    KEEP_ALIVE_TIMEOUT,
};
use crate::token::{Leg, PairingState, TokenRegistry};
use crate::transport::{Acceptor, BoxedStream, TransportError};
use crate::tunnel::DuplexConn;
use bytes::Bytes;
use chrono::Utc;
use http::header::{self, HeaderValue};
use http::Method;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Server construction options
#[derive(Clone)]
pub struct ServerOptions {
    pub camouflage: Arc<CamouflageConfig>,
    /// How long an issued token waits for both legs
    pub token_ttl: Duration,
    pub sweep_interval: Duration,
    pub decoy: Arc<dyn DecoyHandler>,
    pub acceptor: Acceptor,
    /// Bound on reading one request head or decoy body
    pub idle_timeout: Duration,
}

impl ServerOptions {
    pub fn new(camouflage: impl Into<Arc<CamouflageConfig>>, token_ttl: Duration) -> Self {
        Self {
            camouflage: camouflage.into(),
            token_ttl,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            decoy: Arc::new(FixedPage::default()),
            acceptor: Acceptor::Plain,
            idle_timeout: KEEP_ALIVE_TIMEOUT,
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_decoy(mut self, decoy: impl DecoyHandler + 'static) -> Self {
        self.decoy = Arc::new(decoy);
        self
    }

    pub fn with_acceptor(mut self, acceptor: Acceptor) -> Self {
        self.acceptor = acceptor;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// State shared by the accept loop and every connection task
struct Shared {
    camouflage: Arc<CamouflageConfig>,
    codec: Codec,
    registry: Arc<TokenRegistry>,
    decoy: Arc<dyn DecoyHandler>,
    acceptor: Acceptor,
    idle_timeout: Duration,
    accepted: mpsc::Sender<DuplexConn>,
    shutdown: watch::Receiver<bool>,
}

/// Tunnel server
pub struct Server {
    shared: Arc<Shared>,
    accepted: Mutex<mpsc::Receiver<DuplexConn>>,
    shutdown: watch::Sender<bool>,
    local_addr: OnceLock<SocketAddr>,
}

impl Server {
    /// Create a server and start its token sweeper. Must be called within a
    /// tokio runtime.
    pub fn new(options: ServerOptions) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

        let registry = Arc::new(
            TokenRegistry::new(options.token_ttl).with_token_len(options.camouflage.token_len),
        );
        registry.spawn_sweeper(options.sweep_interval, shutdown_rx.clone());

        Self {
            shared: Arc::new(Shared {
                codec: Codec::for_server(&options.camouflage),
                camouflage: options.camouflage,
                registry,
                decoy: options.decoy,
                acceptor: options.acceptor,
                idle_timeout: options.idle_timeout,
                accepted: tx,
                shutdown: shutdown_rx,
            }),
            accepted: Mutex::new(rx),
            shutdown,
            local_addr: OnceLock::new(),
        }
    }

    /// Bind a TCP listener on `addr` and start serving it
    pub async fn bind(addr: &str, options: ServerOptions) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let server = Self::new(options);
        server.serve(listener)?;
        Ok(server)
    }

    /// Serve connections from `listener` until the server is closed
    pub fn serve(&self, listener: TcpListener) -> crate::Result<JoinHandle<()>> {
        let local_addr = listener.local_addr()?;
        // The first listener served provides the reported address
        let _ = self.local_addr.set(local_addr);
        info!("Listening on {}", local_addr);

        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shared.shutdown.clone();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_closed(&mut shutdown) => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let shared = Arc::clone(&shared);
                            tokio::spawn(async move {
                                let local = stream.local_addr().ok();
                                match shared.acceptor.accept(stream).await {
                                    Ok(conn) => shared.serve_connection(conn, Some(peer), local).await,
                                    Err(e) => debug!("transport handshake with {} failed: {}", peer, e),
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            debug!("listener on {} stopped", local_addr);
        }))
    }

    /// Serve one already-established connection in a new task. The stream
    /// may be any transport; it is read as HTTP/1.1 from its first byte.
    pub fn serve_connection(
        &self,
        stream: BoxedStream,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { shared.serve_connection(stream, peer, local).await })
    }

    /// Wait for the next paired tunnel. Fails with `ServerClose` once the
    /// server is closed.
    pub async fn accept(&self) -> crate::Result<DuplexConn> {
        let mut shutdown = self.shutdown.subscribe();
        let mut accepted = self.accepted.lock().await;
        tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown) => Err(ProtocolError::ServerClose.into()),
            conn = accepted.recv() => conn.ok_or_else(|| ProtocolError::ServerClose.into()),
        }
    }

    /// Stop accepting and stop the sweeper. A second call fails with `ServerClose`.
    pub fn close(&self) -> crate::Result<()> {
        if self.shutdown.send_replace(true) {
            return Err(ProtocolError::ServerClose.into());
        }
        info!("Server closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Address of the served listener, if any
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.shared.registry
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn write_head<W: AsyncWrite + Unpin>(writer: &mut W, head: &ResponseHead) -> io::Result<()> {
    writer.write_all(&head.encode()).await?;
    writer.flush().await
}

impl Shared {
    async fn serve_connection(
        &self,
        stream: BoxedStream,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) {
        let mut reader = BufReader::new(stream);
        loop {
            let head =
                match tokio::time::timeout(self.idle_timeout, read_request_head(&mut reader)).await {
                    Ok(Ok(Some(head))) => head,
                    Ok(Ok(None)) => return,
                    Ok(Err(e)) => {
                        debug!("bad request from {:?}: {}", peer, e);
                        return;
                    }
                    Err(_) => {
                        trace!("keep-alive connection from {:?} idle, closing", peer);
                        return;
                    }
                };

            match classify(&head, &self.camouflage, &self.registry).await {
                Route::Leg { role, token, state } => {
                    self.take_over(reader, &head, role, &token, state, peer, local)
                        .await;
                    return;
                }
                Route::Decoy(reason) => {
                    trace!("decoy {} {} from {:?}: {}", head.method, head.uri, peer, reason);
                    match self.serve_decoy(&mut reader, &head).await {
                        Ok(true) => continue,
                        Ok(false) => return,
                        Err(e) => {
                            debug!("decoy response to {:?} failed: {}", peer, e);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Answer with decoy content and a fresh token. Returns whether the
    /// connection stays open for another request.
    async fn serve_decoy(
        &self,
        reader: &mut BufReader<BoxedStream>,
        head: &RequestHead,
    ) -> crate::Result<bool> {
        let length = head.body_length()?;
        tokio::time::timeout(self.idle_timeout, drain_body(reader, length))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let token = self.registry.issue();
        let keep_alive = head.keep_alive();
        let response = self.decoy.respond(head).await;
        let out = self.decoy_head(&response, &token, keep_alive)?;

        let stream = reader.get_mut();
        stream.write_all(&out.encode()).await?;
        if head.method != Method::HEAD {
            stream.write_all(&response.body).await?;
        }
        stream.flush().await?;
        if !keep_alive {
            stream.shutdown().await.ok();
        }
        Ok(keep_alive)
    }

    fn decoy_head(
        &self,
        response: &DecoyResponse,
        token: &str,
        keep_alive: bool,
    ) -> Result<ResponseHead, HttpError> {
        let expires = Utc::now() + chrono::Duration::days(ISSUANCE_COOKIE_DAYS);
        Ok(ResponseHead::new(response.status)
            .with_header(header::SERVER, header_value(&self.camouflage.server_header)?)
            .with_header(header::CONTENT_TYPE, header_value(&response.content_type)?)
            .with_header(header::CONTENT_LENGTH, HeaderValue::from(response.body.len()))
            .with_header(
                header::SET_COOKIE,
                header_value(set_cookie_value(&self.camouflage.issue_cookie, token, expires))?,
            )
            .with_header(
                header::CONNECTION,
                HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
            ))
    }

    /// Write the camouflage head, take the raw stream and park it as a leg.
    /// Promotes the pair if this leg completes it.
    #[allow(clippy::too_many_arguments)]
    async fn take_over(
        &self,
        mut reader: BufReader<BoxedStream>,
        head: &RequestHead,
        role: Role,
        token: &str,
        state: Arc<PairingState>,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
    ) {
        let written = match takeover_head(&self.camouflage, role, token) {
            Ok(response) => write_head(reader.get_mut(), &response)
                .await
                .map_err(crate::Error::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            debug!("{} leg from {:?} failed before takeover: {}", role, peer, e);
            return;
        }

        let buffered = Bytes::copy_from_slice(reader.buffer());
        let leg = Leg {
            conn: reader.into_inner(),
            buffered,
            peer_addr: peer,
            local_addr: local,
            forwarded_for: head
                .header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        };

        let mut slots = state.slots().await;
        if slots.store(role, leg).is_err() {
            debug!("{} leg for token {} refused, slot unavailable", role, token);
            return;
        }
        trace!("{} leg for token {} stored", role, token);

        if !slots.is_paired() {
            return;
        }
        if self.registry.consume(token).is_none() {
            // Evicted meanwhile; the eviction closes the stored legs
            return;
        }
        let Some((upload, download)) = slots.take_pair() else {
            return;
        };
        drop(slots);

        let mut conn =
            DuplexConn::compose(upload.conn, download.conn, upload.buffered, &self.codec)
                .with_addrs(download.local_addr, download.peer_addr);
        if let Some(label) = upload.forwarded_for.or(download.forwarded_for) {
            conn = conn.with_peer_label(label);
        }
        debug!("tunnel paired for token {} from {}", token, conn.peer());
        self.deliver(conn).await;
    }

    async fn deliver(&self, conn: DuplexConn) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            sent = self.accepted.send(conn) => {
                if sent.is_err() {
                    debug!("accept queue gone, tunnel dropped");
                }
            }
            _ = wait_closed(&mut shutdown) => {
                debug!("server closed, tunnel dropped");
            }
        }
    }
}

/// Resolves once the server is closed or the close signal is gone
async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    // The borrow guard must not live past this statement
    let _ = shutdown.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::read_response_head;
    use http::{StatusCode, Uri};
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn get(target: &'static str) -> RequestHead {
        RequestHead::new(Method::GET, Uri::from_static(target))
    }

    fn options(ttl: Duration) -> ServerOptions {
        ServerOptions::new(CamouflageConfig::default(), ttl)
            .with_decoy(FixedPage::new(DecoyResponse::ok("text/plain", "decoy")))
    }

    fn connect(server: &Server) -> BufReader<DuplexStream> {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        server.serve_connection(Box::new(server_side), None, None);
        BufReader::new(client)
    }

    async fn roundtrip(
        conn: &mut BufReader<DuplexStream>,
        head: &RequestHead,
        body: &[u8],
    ) -> ResponseHead {
        let mut out = head.encode();
        out.extend_from_slice(body);
        conn.get_mut().write_all(&out).await.unwrap();
        read_response_head(conn).await.unwrap()
    }

    fn leg_request(camouflage: &CamouflageConfig, role: Role, token: &str) -> RequestHead {
        let method = Method::from_bytes(camouflage.method(role).as_bytes()).unwrap();
        let cookie = format!(
            "{}={}; {}={}",
            camouflage.token_cookie,
            token,
            camouflage.role_cookie,
            camouflage.flag(role)
        );
        RequestHead::new(method, Uri::from_static("/"))
            .with_header(header::COOKIE, header_value(cookie).unwrap())
    }

    #[tokio::test]
    async fn test_decoy_then_leg_on_same_connection() {
        let server = Server::new(options(Duration::from_secs(30)));
        let camouflage = CamouflageConfig::default();

        let mut upload = connect(&server);
        let resp = roundtrip(&mut upload, &get("/index.html"), b"").await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.header("Server"), Some("nginx"));
        assert!(resp.header("Set-Cookie").unwrap().contains("Expires="));
        let token = resp.set_cookie("cna").unwrap().to_string();
        let n = drain_body(&mut upload, resp.body_length().unwrap())
            .await
            .unwrap();
        assert_eq!(n, 5);

        let leg = leg_request(&camouflage, Role::Upload, &token);
        let resp = roundtrip(&mut upload, &leg, b"early").await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.header("Content-Encoding"), Some("gzip"));
        assert_eq!(resp.header("Set-Cookie"), None);

        let mut download = connect(&server);
        let leg = leg_request(&camouflage, Role::Download, &token);
        let resp = roundtrip(&mut download, &leg, b"").await;
        assert_eq!(resp.status, StatusCode::OK);

        let mut tunnel = server.accept().await.unwrap();
        let mut buf = [0u8; 5];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        tunnel.write_all(b"reply").await.unwrap();
        tunnel.flush().await.unwrap();
        download.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        assert!(!server.registry().contains(&token));
    }

    #[tokio::test]
    async fn test_role_mismatch_is_decoy() {
        let server = Server::new(options(Duration::from_secs(30)));
        let camouflage = CamouflageConfig::default();
        let token = server.registry().issue();

        let mut conn = connect(&server);
        let head = leg_request(&camouflage, Role::Upload, &token);
        let head = RequestHead { method: Method::GET, ..head };
        let resp = roundtrip(&mut conn, &head, b"").await;
        assert!(resp.set_cookie("cna").is_some());
        let mut body = [0u8; 5];
        conn.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"decoy");
    }

    #[tokio::test]
    async fn test_head_request_has_no_body() {
        let server = Server::new(options(Duration::from_secs(30)));
        let mut conn = connect(&server);

        let resp = roundtrip(&mut conn, &RequestHead::new(Method::HEAD, Uri::from_static("/")), b"").await;
        assert_eq!(resp.header("Content-Length"), Some("5"));

        // Parsing the next status line fails if a body had been sent
        let resp = roundtrip(&mut conn, &get("/"), b"").await;
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_websocket_takeover() {
        let mut camouflage = CamouflageConfig::default();
        camouflage.websocket = true;
        let server = Server::new(ServerOptions::new(camouflage.clone(), Duration::from_secs(30)));
        let token = server.registry().issue();

        let mut conn = connect(&server);
        let resp = roundtrip(&mut conn, &leg_request(&camouflage, Role::Download, &token), b"").await;
        assert_eq!(resp.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(resp.header("Upgrade"), Some("websocket"));
        assert_eq!(resp.header("Sec-WebSocket-Accept"), Some(token.as_str()));
    }

    #[tokio::test]
    async fn test_slow_decoy_body_closed() {
        let server = Server::new(
            options(Duration::from_secs(30)).with_idle_timeout(Duration::from_millis(100)),
        );
        let mut conn = connect(&server);
        let head = RequestHead::new(Method::POST, Uri::from_static("/form"))
            .with_header(header::CONTENT_LENGTH, HeaderValue::from(10usize));
        let mut out = head.encode();
        out.extend_from_slice(b"ab");
        conn.get_mut().write_all(&out).await.unwrap();

        // The rest of the body never arrives
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_serve_stops_on_close() {
        let server = Server::new(options(Duration::from_secs(30)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let serving = server.serve(listener).unwrap();

        server.close().unwrap();
        tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_leg_dropped() {
        let server = Server::new(options(Duration::from_secs(30)));
        let camouflage = CamouflageConfig::default();
        let token = server.registry().issue();
        let state = server.registry().validate(&token).await.unwrap();

        let mut first = connect(&server);
        roundtrip(&mut first, &leg_request(&camouflage, Role::Upload, &token), b"").await;
        while !state.slots().await.is_occupied(Role::Upload) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut second = connect(&server);
        let resp = roundtrip(&mut second, &leg_request(&camouflage, Role::Upload, &token), b"").await;
        assert_eq!(resp.status, StatusCode::OK);
        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).await.unwrap(), 0);
        assert!(server.registry().contains(&token));
    }

    #[tokio::test]
    async fn test_half_open_leg_swept() {
        let server = Server::new(
            options(Duration::from_millis(100)).with_sweep_interval(Duration::from_millis(50)),
        );
        let camouflage = CamouflageConfig::default();
        let token = server.registry().issue();

        let mut upload = connect(&server);
        roundtrip(&mut upload, &leg_request(&camouflage, Role::Upload, &token), b"").await;

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), upload.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(!server.registry().contains(&token));
    }

    #[tokio::test]
    async fn test_close() {
        let server = Arc::new(Server::new(options(Duration::from_secs(30))));

        let pending = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.accept().await })
        };
        tokio::task::yield_now().await;

        server.close().unwrap();
        assert!(server.is_closed());
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err.protocol(), Some(ProtocolError::ServerClose)));

        let err = server.close().unwrap_err();
        assert!(matches!(err.protocol(), Some(ProtocolError::ServerClose)));
        let err = server.accept().await.unwrap_err();
        assert!(matches!(err.protocol(), Some(ProtocolError::ServerClose)));
    }

    #[tokio::test]
    async fn test_bind_reports_address() {
        let server = Server::bind("127.0.0.1:0", options(Duration::from_secs(30)))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }
}
