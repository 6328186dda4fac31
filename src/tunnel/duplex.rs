//! Duplex stream composed from an input leg and an output leg

use crate::obfuscation::{BoxedReader, BoxedWriter, Codec};
use crate::transport::{BoxedStream, Deadline};
use bytes::{Buf, Bytes};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::Instant;

/// Serves `prefix` before reading from `inner`
pub struct PrefixedReader<R> {
    prefix: Bytes,
    inner: R,
}

impl<R: AsyncRead + Unpin> PrefixedReader<R> {
    pub fn new(prefix: Bytes, inner: R) -> Self {
        Self { prefix, inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "duplex connection closed")
}

/// One logical stream over two physical legs.
///
/// Reads come first from the bytes the HTTP layer had already buffered for
/// the input leg, then from the input leg itself. Writes go to the output
/// leg.
pub struct DuplexConn {
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
    write_shut: bool,
    read_deadline: Deadline,
    write_deadline: Deadline,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    peer_label: Option<String>,
}

impl DuplexConn {
    /// Compose `input` (read side, with `buffered` bytes already taken from
    /// it) and `output` (write side), framing each direction per `codec`.
    pub fn compose(input: BoxedStream, output: BoxedStream, buffered: Bytes, codec: &Codec) -> Self {
        let input: BoxedReader = if buffered.is_empty() {
            Box::new(input)
        } else {
            Box::new(PrefixedReader::new(buffered, input))
        };
        Self::from_parts(codec.wrap_reader(input), codec.wrap_writer(Box::new(output)))
    }

    fn from_parts(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: Some(reader),
            writer: Some(writer),
            write_shut: false,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
            local_addr: None,
            peer_addr: None,
            peer_label: None,
        }
    }

    pub fn with_addrs(mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) -> Self {
        self.local_addr = local;
        self.peer_addr = peer;
        self
    }

    /// Record where the tunnel really comes from, e.g. a proxy's `X-Forwarded-For`
    pub fn with_peer_label(mut self, label: impl Into<String>) -> Self {
        self.peer_label = Some(label.into());
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Peer label if one was recorded, else the peer address
    pub fn peer(&self) -> String {
        match (&self.peer_label, self.peer_addr) {
            (Some(label), _) => label.clone(),
            (None, Some(addr)) => addr.to_string(),
            (None, None) => "unknown".to_string(),
        }
    }

    pub fn set_read_deadline(&mut self, at: Option<Instant>) -> io::Result<()> {
        if self.reader.is_none() {
            return Err(closed());
        }
        self.read_deadline.set(at);
        Ok(())
    }

    pub fn set_write_deadline(&mut self, at: Option<Instant>) -> io::Result<()> {
        if self.writer.is_none() {
            return Err(closed());
        }
        self.write_deadline.set(at);
        Ok(())
    }

    /// Apply `at` to both directions; the first failure is returned
    pub fn set_deadline(&mut self, at: Option<Instant>) -> io::Result<()> {
        let read = self.set_read_deadline(at);
        let write = self.set_write_deadline(at);
        read.and(write)
    }

    /// Close the output leg, then the input leg. Both are attempted; the
    /// first error is returned. Closing again is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        let mut result = Ok(());
        if let Some(mut writer) = self.writer.take() {
            if !self.write_shut {
                result = writer.shutdown().await;
                self.write_shut = true;
            }
        }
        // Dropping the read chain stops any decoder task and releases the leg
        self.reader.take();
        result
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }
}

impl fmt::Debug for DuplexConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexConn")
            .field("local_addr", &self.local_addr)
            .field("peer", &self.peer())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AsyncRead for DuplexConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(reader) = this.reader.as_mut() else {
            return Poll::Ready(Err(closed()));
        };
        this.read_deadline.poll_check(cx)?;
        Pin::new(reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let writer = match this.writer.as_mut() {
            Some(w) if !this.write_shut => w,
            _ => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        };
        this.write_deadline.poll_check(cx)?;
        Pin::new(writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.writer.as_mut() {
            Some(writer) => {
                this.write_deadline.poll_check(cx)?;
                Pin::new(writer).poll_flush(cx)
            }
            None => Poll::Ready(Ok(())),
        }
    }

    /// Half-close: the output leg is shut down, the input leg stays readable
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_shut {
            return Poll::Ready(Ok(()));
        }
        match this.writer.as_mut() {
            Some(writer) => {
                let result = std::task::ready!(Pin::new(writer).poll_shutdown(cx));
                this.write_shut = true;
                Poll::Ready(result)
            }
            None => Poll::Ready(Ok(())),
        }
    }
}
