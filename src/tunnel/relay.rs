//! Byte pump between a tunnel and another stream

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Copy both ways until both directions have ended, propagating half-close.
/// Returns `(a_to_b, b_to_a)` byte counts.
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (a_to_b, b_to_a) = tokio::io::copy_bidirectional(a, b).await?;
    debug!("relay finished: {} bytes out, {} bytes back", a_to_b, b_to_a);
    Ok((a_to_b, b_to_a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_both_ways() {
        let (mut a, mut a_peer) = tokio::io::duplex(1024);
        let (mut b, mut b_peer) = tokio::io::duplex(1024);

        let pump = tokio::spawn(async move { relay(&mut a, &mut b).await });

        a_peer.write_all(b"request").await.unwrap();
        a_peer.shutdown().await.unwrap();
        let mut got = Vec::new();
        b_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"request");

        b_peer.write_all(b"response!").await.unwrap();
        b_peer.shutdown().await.unwrap();
        let mut got = Vec::new();
        a_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"response!");

        assert_eq!(pump.await.unwrap().unwrap(), (7, 9));
    }
}
