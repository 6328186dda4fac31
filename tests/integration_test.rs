//! Integration tests for httptun
//!
//! Runs real loopback servers and clients through:
//! - Token issuance and two-leg pairing
//! - Data transfer over every framing
//! - Decoy handling and rejected legs
//! - Half-open reclamation and server shutdown
//! - TLS legs against the certificates in `tests/data`

use http::header::{self, HeaderValue};
use http::{Method, StatusCode, Uri};
use httptun::config::CamouflageConfig;
use httptun::http::{header_value, read_request_head, read_response_head, RequestHead, ResponseHead};
use httptun::obfuscation::{Framing, PaddingConfig, PaddingStrategy};
use httptun::protocol::{ProtocolError, Role};
use httptun::server::{DecoyResponse, FixedPage};
use httptun::tunnel::relay;
use httptun::{Client, Server, ServerOptions};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

async fn start_server(camouflage: CamouflageConfig, ttl: Duration) -> (Server, SocketAddr) {
    let options = ServerOptions::new(camouflage, ttl)
        .with_sweep_interval(Duration::from_millis(100))
        .with_decoy(FixedPage::new(DecoyResponse::ok("text/html", "<p>hello</p>")));
    let server = Server::bind("127.0.0.1:0", options).await.unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Open one leg by hand, optionally sending bytes right after the head
async fn open_raw_leg(
    addr: SocketAddr,
    camouflage: &CamouflageConfig,
    role: Role,
    token: &str,
    payload: &[u8],
) -> (BufReader<TcpStream>, ResponseHead) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut reader = BufReader::new(stream);
    let cookie = format!(
        "{}={}; {}={}",
        camouflage.token_cookie,
        token,
        camouflage.role_cookie,
        camouflage.flag(role)
    );
    let method = Method::from_bytes(camouflage.method(role).as_bytes()).unwrap();
    let head = RequestHead::new(method, Uri::from_static("/"))
        .with_header(header::COOKIE, header_value(cookie).unwrap());
    let mut out = head.encode();
    out.extend_from_slice(payload);
    reader.get_mut().write_all(&out).await.unwrap();
    let response = read_response_head(&mut reader).await.unwrap();
    (reader, response)
}

async fn echo_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                tokio::io::copy(&mut r, &mut w).await.ok();
            });
        }
    });
    addr
}

/// Dial a tunnel and check data flows both ways
async fn exchange(camouflage: CamouflageConfig) {
    let (server, addr) = start_server(camouflage.clone(), Duration::from_secs(30)).await;
    let client = Client::new(addr.to_string(), camouflage);
    check_tunnel(server, client).await;
}

async fn check_tunnel(server: Server, client: Client) {
    let accept = tokio::spawn(async move {
        let tunnel = server.accept().await.unwrap();
        (server, tunnel)
    });
    let mut tunnel = client.dial().await.unwrap();
    let (_server, mut remote) = tokio::time::timeout(Duration::from_secs(5), accept)
        .await
        .unwrap()
        .unwrap();

    tunnel.write_all(b"hello from client").await.unwrap();
    tunnel.flush().await.unwrap();
    let mut buf = [0u8; 17];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello from client");

    remote.write_all(b"hello from server").await.unwrap();
    remote.flush().await.unwrap();
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello from server");

    tunnel.close().await.unwrap();
    let mut rest = Vec::new();
    remote.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_dial_raw() {
    exchange(CamouflageConfig::default()).await;
}

#[tokio::test]
async fn test_dial_websocket() {
    exchange(CamouflageConfig {
        websocket: true,
        ..CamouflageConfig::default()
    })
    .await;
}

#[tokio::test]
async fn test_dial_mixed_framings() {
    exchange(CamouflageConfig {
        upload_framing: Framing::Chunked,
        download_framing: Framing::Padded,
        ..CamouflageConfig::default()
    })
    .await;

    exchange(CamouflageConfig {
        upload_framing: Framing::ChunkedPadded,
        download_framing: Framing::ChunkedPadded,
        padding: PaddingConfig {
            strategy: PaddingStrategy::Random(96),
            min_size: 32,
            max_padding: 128,
        },
        ..CamouflageConfig::default()
    })
    .await;
}

#[tokio::test]
async fn test_relay_large_transfer() {
    let camouflage = CamouflageConfig {
        upload_framing: Framing::Padded,
        download_framing: Framing::Chunked,
        ..CamouflageConfig::default()
    };
    let (server, addr) = start_server(camouflage.clone(), Duration::from_secs(30)).await;
    let target = echo_target().await;

    tokio::spawn(async move {
        while let Ok(mut tunnel) = server.accept().await {
            tokio::spawn(async move {
                let mut upstream = TcpStream::connect(target).await.unwrap();
                relay(&mut tunnel, &mut upstream).await.ok();
            });
        }
    });

    let client = Client::new(addr.to_string(), camouflage);
    let tunnel = client.dial().await.unwrap();
    let (mut reader, mut writer) = tokio::io::split(tunnel);

    let data: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = data.clone();
    let send = tokio::spawn(async move {
        writer.write_all(&data).await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let mut echoed = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), reader.read_to_end(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    send.await.unwrap();
    assert_eq!(echoed.len(), expected.len());
    assert_eq!(echoed, expected);
}

#[tokio::test]
async fn test_accept_waits_for_both_legs() {
    let camouflage = CamouflageConfig::default();
    let (server, addr) = start_server(camouflage.clone(), Duration::from_secs(30)).await;
    let token = Client::new(addr.to_string(), camouflage.clone())
        .fetch_token()
        .await
        .unwrap();

    let (_upload, response) = open_raw_leg(addr, &camouflage, Role::Upload, &token, b"").await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(tokio::time::timeout(Duration::from_millis(200), server.accept())
        .await
        .is_err());
    assert!(server.registry().contains(&token));

    let (_download, response) =
        open_raw_leg(addr, &camouflage, Role::Download, &token, b"").await;
    assert_eq!(response.status, StatusCode::OK);
    tokio::time::timeout(Duration::from_secs(2), server.accept())
        .await
        .unwrap()
        .unwrap();
    assert!(!server.registry().contains(&token));
}

#[tokio::test]
async fn test_hijacked_bytes_come_first() {
    let camouflage = CamouflageConfig::default();
    let (server, addr) = start_server(camouflage.clone(), Duration::from_secs(30)).await;

    // Decoy first, then the upload leg on the same keep-alive connection
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut upload = BufReader::new(stream);
    upload
        .get_mut()
        .write_all(&RequestHead::new(Method::GET, Uri::from_static("/")).encode())
        .await
        .unwrap();
    let response = read_response_head(&mut upload).await.unwrap();
    let token = response.set_cookie("cna").unwrap().to_string();
    let mut body = vec![0u8; "<p>hello</p>".len()];
    upload.read_exact(&mut body).await.unwrap();

    let leg = RequestHead::new(Method::POST, Uri::from_static("/")).with_header(
        header::COOKIE,
        header_value(format!("_tb_token_={token}; _cna=0")).unwrap(),
    );
    let mut out = leg.encode();
    out.extend_from_slice(b"prefix-bytes");
    upload.get_mut().write_all(&out).await.unwrap();
    read_response_head(&mut upload).await.unwrap();
    upload.get_mut().write_all(b"+live").await.unwrap();

    let (_download, _) = open_raw_leg(addr, &camouflage, Role::Download, &token, b"").await;
    let mut tunnel = server.accept().await.unwrap();
    let mut buf = [0u8; 17];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"prefix-bytes+live");
}

#[tokio::test]
async fn test_decoy_always_issues_token() {
    let camouflage = CamouflageConfig::default();
    let (server, addr) = start_server(camouflage.clone(), Duration::from_secs(30)).await;

    let mut tokens = Vec::new();
    for cookie in ["", "_tb_token_=bogus; _cna=1", "_cna=0"] {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut head = RequestHead::new(Method::GET, Uri::from_static("/"))
            .with_header(header::CONNECTION, HeaderValue::from_static("close"));
        if !cookie.is_empty() {
            head = head.with_header(header::COOKIE, HeaderValue::from_static(cookie));
        }
        reader.get_mut().write_all(&head.encode()).await.unwrap();

        let response = read_response_head(&mut reader).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        tokens.push(response.set_cookie("cna").unwrap().to_string());
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "<p>hello</p>");
    }

    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), 3);
    for token in &tokens {
        assert!(server.registry().contains(token));
    }
}

#[tokio::test]
async fn test_no_double_promotion() {
    let camouflage = CamouflageConfig::default();
    let (server, addr) = start_server(camouflage.clone(), Duration::from_secs(30)).await;
    let token = server.registry().issue();

    let (up, down) = tokio::join!(
        open_raw_leg(addr, &camouflage, Role::Upload, &token, b""),
        open_raw_leg(addr, &camouflage, Role::Download, &token, b""),
    );
    assert_eq!(up.1.status, StatusCode::OK);
    assert_eq!(down.1.status, StatusCode::OK);
    tokio::time::timeout(Duration::from_secs(2), server.accept())
        .await
        .unwrap()
        .unwrap();

    // The token is spent; a late leg is just another web request
    let (_late, response) = open_raw_leg(addr, &camouflage, Role::Download, &token, b"").await;
    assert!(response.set_cookie("cna").is_some());
    assert!(tokio::time::timeout(Duration::from_millis(200), server.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn test_half_open_leg_closed_after_ttl() {
    let camouflage = CamouflageConfig::default();
    let (server, addr) = start_server(camouflage.clone(), Duration::from_millis(200)).await;
    let token = server.registry().issue();

    let (mut upload, response) = open_raw_leg(addr, &camouflage, Role::Upload, &token, b"").await;
    assert_eq!(response.status, StatusCode::OK);

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), upload.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert!(!server.registry().contains(&token));
}

#[tokio::test]
async fn test_rejected_leg_fails_dial_and_closes_sibling() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (upload_closed_tx, upload_closed_rx) = oneshot::channel();

    // Issues a token, accepts the upload leg, treats the download leg as a decoy
    tokio::spawn(async move {
        let mut upload_closed_tx = Some(upload_closed_tx);
        while let Ok((stream, _)) = listener.accept().await {
            let mut reader = BufReader::new(stream);
            let head = read_request_head(&mut reader).await.unwrap().unwrap();
            match (head.cookie("_tb_token_"), head.method.as_str()) {
                (None, _) => {
                    reader
                        .get_mut()
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nSet-Cookie: cna=abc123\r\n\
                              Content-Length: 0\r\nConnection: close\r\n\r\n",
                        )
                        .await
                        .unwrap();
                }
                (Some(_), "POST") => {
                    reader
                        .get_mut()
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\n\r\n")
                        .await
                        .unwrap();
                    let tx = upload_closed_tx.take();
                    tokio::spawn(async move {
                        let mut sink = Vec::new();
                        reader.read_to_end(&mut sink).await.ok();
                        if let Some(tx) = tx {
                            tx.send(()).ok();
                        }
                    });
                }
                (Some(_), _) => {
                    // Let the upload leg land first
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    reader
                        .get_mut()
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nSet-Cookie: cna=fresh\r\n\
                              Content-Length: 0\r\n\r\n",
                        )
                        .await
                        .unwrap();
                }
            }
        }
    });

    let client = Client::new(addr.to_string(), CamouflageConfig::default());
    let err = client.dial().await.unwrap_err();
    assert!(matches!(err.protocol(), Some(ProtocolError::TokenTimeout)));

    tokio::time::timeout(Duration::from_secs(2), upload_closed_rx)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_dial_non_tunnel_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            stream.read(&mut buf).await.ok();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .ok();
        }
    });

    let client = Client::new(addr.to_string(), CamouflageConfig::default());
    let err = client.dial().await.unwrap_err();
    assert!(matches!(err.protocol(), Some(ProtocolError::NotServer)));
}

#[tokio::test]
async fn test_close_stops_accept() {
    let (server, addr) = start_server(CamouflageConfig::default(), Duration::from_secs(30)).await;
    server.close().unwrap();

    let err = server.accept().await.unwrap_err();
    assert!(matches!(err.protocol(), Some(ProtocolError::ServerClose)));
    let err = server.close().unwrap_err();
    assert!(matches!(err.protocol(), Some(ProtocolError::ServerClose)));

    // The listener stops shortly after close
    tokio::time::sleep(Duration::from_millis(50)).await;
    let client = Client::new(addr.to_string(), CamouflageConfig::default())
        .with_timeout(Duration::from_millis(500));
    assert!(client.dial().await.is_err());
}

#[cfg(feature = "tls")]
mod tls {
    use super::*;
    use httptun::config::ClientConfig;
    use httptun::transport::{build_acceptor, Acceptor};

    fn test_data(name: &str) -> String {
        format!("{}/tests/data/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    async fn start_tls_server(camouflage: CamouflageConfig) -> (Server, SocketAddr) {
        let acceptor = build_acceptor(test_data("server.pem"), test_data("server.key")).unwrap();
        let options = ServerOptions::new(camouflage, Duration::from_secs(30))
            .with_acceptor(Acceptor::Tls(acceptor))
            .with_decoy(FixedPage::new(DecoyResponse::ok("text/html", "<p>hello</p>")));
        let server = Server::bind("127.0.0.1:0", options).await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    fn tls_client_config(addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            server: addr.to_string(),
            tls: true,
            tls_sni: Some("localhost".to_string()),
            timeout_secs: 5,
            ..ClientConfig::default()
        }
    }

    #[tokio::test]
    async fn test_dial_tls_pinned_ca() {
        let camouflage = CamouflageConfig::default();
        let (server, addr) = start_tls_server(camouflage.clone()).await;
        let config = ClientConfig {
            tls_ca: Some(test_data("ca.pem")),
            ..tls_client_config(addr)
        };
        let client = Client::from_config(&config, &camouflage).unwrap();
        check_tunnel(server, client).await;
    }

    #[tokio::test]
    async fn test_dial_tls_insecure() {
        let camouflage = CamouflageConfig {
            download_framing: Framing::ChunkedPadded,
            ..CamouflageConfig::default()
        };
        let (server, addr) = start_tls_server(camouflage.clone()).await;
        let config = ClientConfig {
            tls_insecure: true,
            ..tls_client_config(addr)
        };
        let client = Client::from_config(&config, &camouflage).unwrap();
        check_tunnel(server, client).await;
    }

    #[tokio::test]
    async fn test_dial_tls_untrusted_certificate() {
        let camouflage = CamouflageConfig::default();
        let (server, addr) = start_tls_server(camouflage.clone()).await;
        // Web PKI roots do not include the test CA
        let client = Client::from_config(&tls_client_config(addr), &camouflage).unwrap();
        assert!(client.dial().await.is_err());
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_plain_client_gets_no_token_from_tls_server() {
        let camouflage = CamouflageConfig::default();
        let (_server, addr) = start_tls_server(camouflage.clone()).await;
        let client =
            Client::new(addr.to_string(), camouflage).with_timeout(Duration::from_secs(2));
        assert!(client.fetch_token().await.is_err());
    }
}
