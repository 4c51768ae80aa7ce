//! Bidirectional byte pump
//!
//! Both directions run concurrently as `tokio::io::copy`. The first one to
//! finish, by EOF or error, ends the bridge and both ends are shut down.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes moved by one bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Writer that tallies accepted bytes, so a cancelled copy still reports
struct Counted<'a, W> {
    inner: W,
    moved: &'a AtomicU64,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Counted<'_, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = polled {
            self.moved.fetch_add(n as u64, Ordering::Relaxed);
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Copy bytes between `a` and `b` until either direction ends
pub async fn bridge_bidirectional<A, B>(a: A, b: B) -> Transferred
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);
    let (mut a_read, a_write) = tokio::io::split(a);
    let (mut b_read, b_write) = tokio::io::split(b);
    let mut a_write = Counted {
        inner: a_write,
        moved: &b_to_a,
    };
    let mut b_write = Counted {
        inner: b_write,
        moved: &a_to_b,
    };

    tokio::select! {
        result = tokio::io::copy(&mut a_read, &mut b_write) => {
            if let Err(e) = result {
                debug!("a->b copy ended: {}", e);
            }
        }
        result = tokio::io::copy(&mut b_read, &mut a_write) => {
            if let Err(e) = result {
                debug!("b->a copy ended: {}", e);
            }
        }
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    Transferred {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (client, a) = tokio::io::duplex(1024);
        let (b, remote) = tokio::io::duplex(1024);
        let bridge = tokio::spawn(bridge_bidirectional(a, b));

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut remote_r, mut remote_w) = tokio::io::split(remote);

        client_w.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        remote_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        remote_w.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        client_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");

        drop(client_w);
        drop(client_r);
        let moved = bridge.await.unwrap();
        assert_eq!(moved, Transferred { a_to_b: 5, b_to_a: 4 });

        // the remote side sees EOF once the bridge ends
        let mut rest = Vec::new();
        remote_r.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_counts_survive_the_losing_direction() {
        let (client, a) = tokio::io::duplex(1024);
        let (b, remote) = tokio::io::duplex(1024);
        let bridge = tokio::spawn(bridge_bidirectional(a, b));

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut remote_r, mut remote_w) = tokio::io::split(remote);

        // b->a moves data but never ends; a->b ends first
        remote_w.write_all(b"banner").await.unwrap();
        let mut buf = [0u8; 6];
        client_r.read_exact(&mut buf).await.unwrap();
        client_w.write_all(b"bye").await.unwrap();
        let mut buf = [0u8; 3];
        remote_r.read_exact(&mut buf).await.unwrap();

        client_w.shutdown().await.unwrap();
        let moved = bridge.await.unwrap();
        assert_eq!(moved, Transferred { a_to_b: 3, b_to_a: 6 });
        drop(remote_w);
    }
}
