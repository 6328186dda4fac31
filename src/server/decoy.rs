//! Decoy web content served to every request that is not a tunnel leg

use crate::http::RequestHead;
use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// A response to a decoy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoyResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
}

impl DecoyResponse {
    pub fn ok(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            content_type: "text/html".to_string(),
            body: Bytes::from_static(NOT_FOUND_PAGE.as_bytes()),
        }
    }
}

/// Produces decoy responses. The server adds the issuance cookie, `Server`,
/// `Content-Length` and `Connection` headers itself.
#[async_trait]
pub trait DecoyHandler: Send + Sync {
    async fn respond(&self, request: &RequestHead) -> DecoyResponse;
}

const WELCOME_PAGE: &str = "<!DOCTYPE html>
<html>
<head>
<title>Welcome to nginx!</title>
</head>
<body>
<h1>Welcome to nginx!</h1>
<p>If you see this page, the nginx web server is successfully installed and
working. Further configuration is required.</p>
<p><em>Thank you for using nginx.</em></p>
</body>
</html>
";

const NOT_FOUND_PAGE: &str = "<html>
<head><title>404 Not Found</title></head>
<body>
<center><h1>404 Not Found</h1></center>
<hr><center>nginx</center>
</body>
</html>
";

/// The same page for every request
#[derive(Debug, Clone)]
pub struct FixedPage {
    response: DecoyResponse,
}

impl FixedPage {
    pub fn new(response: DecoyResponse) -> Self {
        Self { response }
    }

    /// A stock web server welcome page
    pub fn welcome() -> Self {
        Self::new(DecoyResponse::ok(
            "text/html",
            Bytes::from_static(WELCOME_PAGE.as_bytes()),
        ))
    }
}

impl Default for FixedPage {
    fn default() -> Self {
        Self::welcome()
    }
}

#[async_trait]
impl DecoyHandler for FixedPage {
    async fn respond(&self, _request: &RequestHead) -> DecoyResponse {
        self.response.clone()
    }
}

/// Serves files below a root directory
#[derive(Debug, Clone)]
pub struct StaticSite {
    root: PathBuf,
}

impl StaticSite {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a request path below the root, refusing anything that climbs out
    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = percent_decode(request_path)?;
        let mut path = self.root.clone();
        for component in Path::new(decoded.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(path)
    }
}

#[async_trait]
impl DecoyHandler for StaticSite {
    async fn respond(&self, request: &RequestHead) -> DecoyResponse {
        let Some(mut path) = self.resolve(request.path()) else {
            return DecoyResponse::not_found();
        };

        if tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            path.push("index.html");
        }

        match tokio::fs::read(&path).await {
            Ok(body) => DecoyResponse::ok(content_type(&path), body),
            Err(e) => {
                trace!("decoy file {} unavailable: {}", path.display(), e);
                DecoyResponse::not_found()
            }
        }
    }
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Decode `%XX` escapes; `None` if malformed or not UTF-8
fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
