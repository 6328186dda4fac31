//! HTTP/1.1 chunked transfer coding over async streams
//!
//! ```text
//! <size in hex>[;ext]\r\n
//! <size bytes of data>\r\n
//! ...
//! 0\r\n
//! [trailer lines]\r\n
//! \r\n
//! ```

use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, ReadBuf};

/// Longest size or trailer line accepted
const MAX_LINE_LEN: usize = 4096;

/// Largest chunk emitted by a single write
const MAX_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Expecting a chunk-size line
    Size,
    /// Inside chunk data, with this many bytes left
    Data(u64),
    /// Expecting the CRLF that ends chunk data
    DataEnd,
    /// Reading trailer lines after the last chunk
    Trailer,
    /// Terminating chunk and trailers consumed
    Done,
}

/// Decodes a chunked body, yielding end-of-stream after the last chunk
#[derive(Debug)]
pub struct ChunkedReader<R> {
    inner: R,
    state: ReadState,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: ReadState::Size,
            line: Vec::new(),
        }
    }

    /// Whether the terminating chunk has been read
    pub fn is_done(&self) -> bool {
        self.state == ReadState::Done
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Accumulate one CRLF-terminated line into `self.line`
    fn poll_line(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let available = ready!(Pin::new(&mut self.inner).poll_fill_buf(cx))?;
            if available.is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "chunked body ended mid-line",
                )));
            }

            let (taken, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (available.len(), false),
            };
            self.line.extend_from_slice(&available[..taken]);
            Pin::new(&mut self.inner).consume(taken);

            if self.line.len() > MAX_LINE_LEN {
                return Poll::Ready(Err(invalid("chunk line too long")));
            }
            if complete {
                return Poll::Ready(Ok(()));
            }
        }
    }

    fn take_line(&mut self) -> Vec<u8> {
        let mut line = std::mem::take(&mut self.line);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        line
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let size = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let size = std::str::from_utf8(size)
        .map_err(|_| invalid("chunk size is not ASCII"))?
        .trim();
    if size.is_empty() || size.len() > 16 {
        return Err(invalid("bad chunk size"));
    }
    u64::from_str_radix(size, 16).map_err(|_| invalid("bad chunk size"))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl<R: AsyncBufRead + Unpin> AsyncRead for ChunkedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match this.state {
                ReadState::Done => return Poll::Ready(Ok(())),
                ReadState::Size => {
                    ready!(this.poll_line(cx))?;
                    let line = this.take_line();
                    let size = parse_chunk_size(&line)?;
                    this.state = if size == 0 {
                        ReadState::Trailer
                    } else {
                        ReadState::Data(size)
                    };
                }
                ReadState::Data(0) => this.state = ReadState::DataEnd,
                ReadState::Data(remaining) => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let available = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;
                    if available.is_empty() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "chunked body ended mid-chunk",
                        )));
                    }
                    let n = available
                        .len()
                        .min(buf.remaining())
                        .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    buf.put_slice(&available[..n]);
                    Pin::new(&mut this.inner).consume(n);
                    this.state = ReadState::Data(remaining - n as u64);
                    return Poll::Ready(Ok(()));
                }
                ReadState::DataEnd => {
                    ready!(this.poll_line(cx))?;
                    if !this.take_line().is_empty() {
                        return Poll::Ready(Err(invalid("missing CRLF after chunk data")));
                    }
                    this.state = ReadState::Size;
                }
                ReadState::Trailer => {
                    ready!(this.poll_line(cx))?;
                    if this.take_line().is_empty() {
                        this.state = ReadState::Done;
                    }
                }
            }
        }
    }
}

/// Encodes every write as one chunk; shutdown emits the terminating chunk
#[derive(Debug)]
pub struct ChunkedWriter<W> {
    inner: W,
    pending: BytesMut,
    finished: bool,
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
            finished: false,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Push encoded bytes still held back to the inner writer
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

impl<W: AsyncWrite + Unpin> AsyncWrite for ChunkedWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "chunked body already terminated",
            )));
        }

        ready!(this.poll_drain(cx))?;

        // A zero-size chunk would terminate the body
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_CHUNK_SIZE);
        this.pending.extend_from_slice(format!("{n:x}\r\n").as_bytes());
        this.pending.extend_from_slice(&buf[..n]);
        this.pending.extend_from_slice(b"\r\n");

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
        if !this.finished {
            ready!(this.poll_drain(cx))?;
            this.pending.extend_from_slice(b"0\r\n\r\n");
            this.finished = true;
        }
        ready!(this.poll_drain(cx))?;
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
