//! Padding frames for length obfuscation
//!
//! Frame format (all fields little endian):
//! ```text
//! +--------+--------+--------+--------+
//! | Padding Size (2B) | Data Size (2B)  |
//! +--------+--------+--------+--------+
//! |   Data (Data Size bytes)           |
//! +--------+--------+--------+--------+
//! |   Filler (rest of Padding Size)    |
//! +--------+--------+--------+--------+
//! ```
//!
//! Padding Size counts the whole frame including the header. A frame whose
//! Padding Size is 4 or less is header-only and carries nothing.

use crate::crypto::{random_below, random_bytes};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use super::BoxedReader;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest frame expressible in the header
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Largest payload a single frame can carry
pub const MAX_FRAME_PAYLOAD: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// Padding frame errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObfuscationError {
    #[error("malformed padding frame: data size {data_size} exceeds body size {body_size}")]
    MalformedFrame { data_size: usize, body_size: usize },

    #[error("payload of {0} bytes does not fit in one frame")]
    PayloadTooLarge(usize),
}

impl From<ObfuscationError> for io::Error {
    fn from(e: ObfuscationError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Padding strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "size", rename_all = "snake_case")]
pub enum PaddingStrategy {
    /// No padding
    None,
    /// Pad to fixed block size
    Block(usize),
    /// Random padding up to max bytes
    Random(usize),
    /// Pad to power of 2
    PowerOfTwo,
}

/// Padding configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaddingConfig {
    /// Strategy for outgoing frames
    pub strategy: PaddingStrategy,
    /// Minimum frame body size (pad small payloads)
    pub min_size: usize,
    /// Maximum padding to add
    pub max_padding: usize,
}

impl Default for PaddingConfig {
    fn default() -> Self {
        Self {
            strategy: PaddingStrategy::Block(64),
            min_size: 64,
            max_padding: 256,
        }
    }
}

impl PaddingConfig {
    /// Calculate padding for a given data length
    pub fn calculate_padding(&self, data_len: usize) -> usize {
        let base_padding = self.min_size.saturating_sub(data_len);
        let total = data_len.saturating_add(base_padding);

        let strategy_padding = match self.strategy {
            PaddingStrategy::None => 0,
            PaddingStrategy::Block(0) => 0,
            PaddingStrategy::Block(block_size) => {
                let remainder = total % block_size;
                if remainder == 0 {
                    0
                } else {
                    block_size - remainder
                }
            }
            PaddingStrategy::Random(max) => random_below(max.min(self.max_padding).saturating_add(1)),
            PaddingStrategy::PowerOfTwo => total
                .checked_next_power_of_two()
                .map_or(0, |next| next - total),
        };

        base_padding
            .saturating_add(strategy_padding)
            .min(self.max_padding)
    }

    /// Total on-wire frame size for a payload of `data_len` bytes, capped at
    /// [`MAX_FRAME_SIZE`]
    pub fn frame_size(&self, data_len: usize) -> usize {
        FRAME_HEADER_SIZE
            .saturating_add(data_len)
            .saturating_add(self.calculate_padding(data_len))
            .min(MAX_FRAME_SIZE)
    }

    /// Reject sizes no frame header can express
    pub fn validate(&self) -> Result<(), String> {
        if self.min_size > MAX_FRAME_PAYLOAD {
            return Err(format!("padding min_size must be at most {MAX_FRAME_PAYLOAD}"));
        }
        if self.max_padding > MAX_FRAME_PAYLOAD {
            return Err(format!("padding max_padding must be at most {MAX_FRAME_PAYLOAD}"));
        }
        match self.strategy {
            PaddingStrategy::Block(size) | PaddingStrategy::Random(size)
                if size > MAX_FRAME_PAYLOAD =>
            {
                Err(format!("padding size must be at most {MAX_FRAME_PAYLOAD}"))
            }
            _ => Ok(()),
        }
    }
}

/// Append one frame carrying `payload` to `out`, sized `frame_size` bytes.
///
/// `frame_size` is raised to fit the payload when it is too small.
pub fn encode_frame(
    payload: &[u8],
    frame_size: usize,
    out: &mut BytesMut,
) -> Result<(), ObfuscationError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ObfuscationError::PayloadTooLarge(payload.len()));
    }
    let frame_size = frame_size
        .max(FRAME_HEADER_SIZE + payload.len())
        .min(MAX_FRAME_SIZE);

    out.reserve(frame_size);
    out.put_u16_le(frame_size as u16);
    out.put_u16_le(payload.len() as u16);
    out.extend_from_slice(payload);

    let filler_len = frame_size - FRAME_HEADER_SIZE - payload.len();
    if filler_len > 0 {
        let mut filler = vec![0u8; filler_len];
        random_bytes(&mut filler);
        out.extend_from_slice(&filler);
    }
    Ok(())
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered. Header-only frames
/// decode to an empty payload.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ObfuscationError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let padding_size = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if padding_size <= FRAME_HEADER_SIZE {
        buf.advance(FRAME_HEADER_SIZE);
        return Ok(Some(Bytes::new()));
    }

    let data_size = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    let body_size = padding_size - FRAME_HEADER_SIZE;
    if data_size > body_size {
        return Err(ObfuscationError::MalformedFrame {
            data_size,
            body_size,
        });
    }
    if buf.len() < padding_size {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    let payload = buf.split_to(data_size).freeze();
    buf.advance(body_size - data_size);
    Ok(Some(payload))
}

/// Bytes decoded by the background task, waiting for `poll_read`
#[derive(Default)]
struct Decoded {
    buffer: BytesMut,
    closed: bool,
    error: Option<io::Error>,
}

fn lock(shared: &Mutex<Decoded>) -> MutexGuard<'_, Decoded> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reads padding frames on a background task and serves their payload.
///
/// The task signals through a single-slot channel: a signal sent while one is
/// already pending is dropped, so a waiting read is woken whenever data or
/// closure becomes available without counting events.
pub struct PaddingReader {
    shared: Arc<Mutex<Decoded>>,
    wake: mpsc::Receiver<()>,
    worker: JoinHandle<()>,
}

impl PaddingReader {
    /// Start decoding `source` on a new task. Must be called within a tokio runtime.
    pub fn spawn(source: BoxedReader) -> Self {
        let shared = Arc::new(Mutex::new(Decoded::default()));
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let worker = tokio::spawn(decode_frames(source, Arc::clone(&shared), wake_tx));
        Self {
            shared,
            wake: wake_rx,
            worker,
        }
    }
}

/// Dropping the reader stops the decoder task and releases the source
impl Drop for PaddingReader {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn decode_frames(
    mut source: BoxedReader,
    shared: Arc<Mutex<Decoded>>,
    wake: mpsc::Sender<()>,
) {
    let mut body = vec![0u8; MAX_FRAME_SIZE];

    let outcome: io::Result<()> = loop {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match source.read(&mut header).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = source.read_exact(&mut header[n..]).await {
                    break Err(e);
                }
            }
            Err(e) => break Err(e),
        }

        let padding_size = u16::from_le_bytes([header[0], header[1]]) as usize;
        if padding_size <= FRAME_HEADER_SIZE {
            continue;
        }

        let data_size = u16::from_le_bytes([header[2], header[3]]) as usize;
        let body_size = padding_size - FRAME_HEADER_SIZE;
        if data_size > body_size {
            break Err(ObfuscationError::MalformedFrame {
                data_size,
                body_size,
            }
            .into());
        }

        if let Err(e) = source.read_exact(&mut body[..body_size]).await {
            break Err(e);
        }

        if data_size > 0 {
            trace!("padding frame: {} data bytes in {}", data_size, padding_size);
            lock(&shared).buffer.extend_from_slice(&body[..data_size]);
            let _ = wake.try_send(());
        }
    };

    {
        let mut state = lock(&shared);
        state.closed = true;
        if let Err(e) = outcome {
            trace!("padding decoder stopped: {}", e);
            state.error = Some(e);
        }
    }
    let _ = wake.try_send(());
}

impl AsyncRead for PaddingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            {
                let mut state = lock(&this.shared);
                if !state.buffer.is_empty() {
                    let n = state.buffer.len().min(buf.remaining());
                    buf.put_slice(&state.buffer[..n]);
                    state.buffer.advance(n);
                    return Poll::Ready(Ok(()));
                }
                if state.closed {
                    return Poll::Ready(match state.error.take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    });
                }
            }

            match this.wake.poll_recv(cx) {
                Poll::Ready(Some(())) => continue,
                // Decoder task is gone without reporting
                Poll::Ready(None) => lock(&this.shared).closed = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Splits writes into padding frames sized by a [`PaddingConfig`]
pub struct PaddingWriter<W> {
    inner: W,
    config: PaddingConfig,
    pending: BytesMut,
}

impl<W: AsyncWrite + Unpin> PaddingWriter<W> {
    pub fn new(inner: W, config: PaddingConfig) -> Self {
        Self {
            inner,
            config,
            pending: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for PaddingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_FRAME_PAYLOAD);
        let frame_size = this.config.frame_size(n);
        encode_frame(&buf[..n], frame_size, &mut this.pending)?;

        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
