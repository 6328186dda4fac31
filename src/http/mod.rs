//! Minimal HTTP/1.1 message heads
//!
//! Only what the tunnel needs: parse request and response heads off a
//! buffered stream without consuming past the blank line, build heads, look
//! up cookies, and skip bodies. Anything left in the reader's buffer after a
//! head belongs to whatever comes next on the connection.

use crate::obfuscation::ChunkedReader;
use chrono::{DateTime, Utc};
use http::header::{self, AsHeaderName, HeaderName, HeaderValue, IntoHeaderName};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest request or response head accepted
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Most header fields accepted in one head
const MAX_HEADERS: usize = 100;

/// HTTP errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed HTTP head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("invalid HTTP head: {0}")]
    Invalid(#[from] http::Error),

    #[error("bad Content-Length")]
    ContentLength,

    #[error("HTTP head too large")]
    HeadTooLarge,

    #[error("connection closed before the HTTP message was complete")]
    UnexpectedEof,
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Fixed(u64),
    Chunked,
    /// Read until the peer closes
    UntilClose,
}

/// Header value from arbitrary text
pub fn header_value(value: impl AsRef<str>) -> Result<HeaderValue, HttpError> {
    HeaderValue::from_str(value.as_ref()).map_err(|e| http::Error::from(e).into())
}

fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Whether a comma-separated header contains `token`
fn contains_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, HttpError> {
    match headers.get(header::CONTENT_LENGTH) {
        Some(v) => v
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(Some)
            .ok_or(HttpError::ContentLength),
        None => Ok(None),
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    contains_token(headers, header::TRANSFER_ENCODING, "chunked")
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Header block in `Title-Case: value` lines followed by the blank line
fn encode_headers(headers: &HeaderMap, out: &mut Vec<u8>) {
    for (name, value) in headers {
        let mut upper = true;
        for &b in name.as_str().as_bytes() {
            out.push(if upper { b.to_ascii_uppercase() } else { b });
            upper = b == b'-';
        }
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, HttpError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(http::Error::from)?;
        let value = HeaderValue::from_bytes(h.value).map_err(http::Error::from)?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// A request line plus header fields
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        header_str(&self.headers, name)
    }

    /// Value of a cookie from any `Cookie` header
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|h| h.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.trim_matches('"'))
    }

    /// Request target without query string
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn body_length(&self) -> Result<BodyLength, HttpError> {
        if is_chunked(&self.headers) {
            return Ok(BodyLength::Chunked);
        }
        Ok(match content_length(&self.headers)? {
            Some(0) | None => BodyLength::Empty,
            Some(n) => BodyLength::Fixed(n),
        })
    }

    /// Whether the connection stays open after the response
    pub fn keep_alive(&self) -> bool {
        if contains_token(&self.headers, header::CONNECTION, "close") {
            return false;
        }
        self.version == Version::HTTP_11
            || contains_token(&self.headers, header::CONNECTION, "keep-alive")
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            format!("{} {} {}\r\n", self.method, self.uri, version_str(self.version)).into_bytes();
        encode_headers(&self.headers, &mut out);
        out
    }
}

/// A status line plus header fields
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        header_str(&self.headers, name)
    }

    /// Value a `Set-Cookie` header assigns to cookie `name`
    pub fn set_cookie(&self, name: &str) -> Option<&str> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|h| h.split(';').next())
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.trim_matches('"'))
    }

    pub fn body_length(&self) -> Result<BodyLength, HttpError> {
        if self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyLength::Empty);
        }
        if is_chunked(&self.headers) {
            return Ok(BodyLength::Chunked);
        }
        Ok(match content_length(&self.headers)? {
            Some(0) => BodyLength::Empty,
            Some(n) => BodyLength::Fixed(n),
            None => BodyLength::UntilClose,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\n",
            version_str(self.version),
            self.status.as_str(),
            self.status.canonical_reason().unwrap_or("")
        )
        .into_bytes();
        encode_headers(&self.headers, &mut out);
        out
    }
}

/// `Set-Cookie` value for cookie `name` expiring at `expires`
pub fn set_cookie_value(name: &str, value: &str, expires: DateTime<Utc>) -> String {
    format!(
        "{name}={value}; Expires={}",
        expires.format("%a, %d %b %Y %H:%M:%S GMT")
    )
}

fn parse_request(buf: &[u8]) -> Result<Option<(usize, RequestHead)>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match req.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
        .map_err(http::Error::from)?;
    let uri = req
        .path
        .unwrap_or_default()
        .parse::<Uri>()
        .map_err(http::Error::from)?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    Ok(Some((
        len,
        RequestHead {
            method,
            uri,
            version,
            headers: collect_headers(req.headers)?,
        },
    )))
}

fn parse_response(buf: &[u8]) -> Result<Option<(usize, ResponseHead)>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let len = match resp.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let status = StatusCode::from_u16(resp.code.unwrap_or_default()).map_err(http::Error::from)?;
    let version = match resp.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    Ok(Some((
        len,
        ResponseHead {
            version,
            status,
            headers: collect_headers(resp.headers)?,
        },
    )))
}

/// Feed the reader's buffer to `parse` until a head completes, then consume
/// exactly the head. `Ok(None)` on EOF with nothing but blank lines read.
async fn read_head<R, T>(
    reader: &mut R,
    parse: fn(&[u8]) -> Result<Option<(usize, T)>, HttpError>,
) -> Result<Option<T>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut seen = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return if seen.iter().all(|b| matches!(b, b'\r' | b'\n')) {
                Ok(None)
            } else {
                Err(HttpError::UnexpectedEof)
            };
        }
        let read = available.len();
        let start = seen.len();
        seen.extend_from_slice(available);

        match parse(&seen)? {
            Some((len, _)) if len > MAX_HEAD_SIZE => return Err(HttpError::HeadTooLarge),
            Some((len, head)) => {
                // Head ends inside this fill; the rest stays buffered
                reader.consume(len - start);
                return Ok(Some(head));
            }
            None if seen.len() >= MAX_HEAD_SIZE => return Err(HttpError::HeadTooLarge),
            None => reader.consume(read),
        }
    }
}

/// Read a request head. `Ok(None)` means the peer closed cleanly between requests.
pub async fn read_request_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<RequestHead>, HttpError> {
    read_head(reader, parse_request).await
}

/// Read a response head
pub async fn read_response_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<ResponseHead, HttpError> {
    read_head(reader, parse_response)
        .await?
        .ok_or(HttpError::UnexpectedEof)
}

/// Read and discard a body, returning the bytes skipped
pub async fn drain_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    length: BodyLength,
) -> Result<u64, HttpError> {
    let mut sink = tokio::io::sink();
    let n = match length {
        BodyLength::Empty => 0,
        BodyLength::Fixed(len) => {
            let n = tokio::io::copy(&mut (&mut *reader).take(len), &mut sink).await?;
            if n < len {
                return Err(HttpError::UnexpectedEof);
            }
            n
        }
        BodyLength::Chunked => {
            tokio::io::copy(&mut ChunkedReader::new(&mut *reader), &mut sink).await?
        }
        BodyLength::UntilClose => tokio::io::copy(reader, &mut sink).await?,
    };
    Ok(n)
}
