//! TCP listener with connection accounting and an optional concurrency cap.
//!
//! [`TrackedListener`] plugs into `axum::serve` through the
//! [`axum::serve::Listener`] trait. Every accepted socket is wrapped in a
//! [`TrackedStream`] that counts itself in [`Metrics`] while open. With a
//! limit configured, accept waits for a free slot, so at most `limit`
//! connections are served at once and the rest queue in the OS backlog.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::status::Metrics;

pub struct TrackedListener {
    inner: TcpListener,
    limit: Option<Arc<Semaphore>>,
    metrics: Arc<Metrics>,
}

impl TrackedListener {
    pub fn new(inner: TcpListener, limit: Option<usize>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner,
            limit: limit.map(|n| Arc::new(Semaphore::new(n))),
            metrics,
        }
    }
}

impl axum::serve::Listener for TrackedListener {
    type Io = TrackedStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        let permit = match &self.limit {
            Some(slots) => slots.clone().acquire_owned().await.ok(),
            None => None,
        };
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    return (TrackedStream::new(stream, permit, self.metrics.clone()), addr);
                }
                Err(e) => {
                    // Resource exhaustion (EMFILE etc.) clears up on its own; back off.
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// An accepted connection, counted as active until dropped.
pub struct TrackedStream {
    inner: TcpStream,
    _permit: Option<OwnedSemaphorePermit>,
    metrics: Arc<Metrics>,
    generation: u64,
}

impl TrackedStream {
    fn new(inner: TcpStream, permit: Option<OwnedSemaphorePermit>, metrics: Arc<Metrics>) -> Self {
        let generation = metrics.connection_opened();
        Self {
            inner,
            _permit: permit,
            metrics,
            generation,
        }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.metrics.connection_closed(self.generation);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::serve::Listener;

    #[tokio::test]
    async fn counts_connections_while_open() {
        let metrics = Arc::new(Metrics::new());
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let mut listener = TrackedListener::new(tcp, None, metrics.clone());

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await;
        assert_eq!(metrics.active_connections(), 1);

        drop(stream);
        drop(client);
        assert_eq!(metrics.active_connections(), 0);
    }

    #[tokio::test]
    async fn limit_holds_back_extra_connections() {
        let metrics = Arc::new(Metrics::new());
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        let mut listener = TrackedListener::new(tcp, Some(1), metrics.clone());

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        let (first, _) = listener.accept().await;

        let second =
            tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err(), "second connection accepted past the limit");
        assert_eq!(metrics.active_connections(), 1);

        drop(first);
        let (second, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap();
        assert_eq!(metrics.active_connections(), 1);
        drop(second);
    }
}
