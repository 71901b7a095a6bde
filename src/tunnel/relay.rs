//! Bidirectional relay and tunnel closure
//!
//! Both directions of a tunnel run concurrently until one of them ends or
//! the tunnel is closed from outside (a failed meter debit). At that point
//! both legs are dropped, which closes the sockets and aborts whatever the
//! other direction was waiting on.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use hyper::body::{Bytes, HttpBody, Sender};
use hyper::Body;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct CloseState {
    closed: AtomicBool,
    notify: Notify,
}

/// Shared close signal for both legs of one tunnel
#[derive(Debug, Clone, Default)]
pub struct TunnelCloser {
    state: Arc<CloseState>,
}

impl TunnelCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the tunnel. Idempotent.
    pub fn close(&self) {
        if !self.state.closed.swap(true, Ordering::AcqRel) {
            self.state.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Copy bytes both ways between `client` and `upstream` until either side
/// finishes or `closer` fires. Both legs are closed on return.
pub async fn relay<C, U>(client: C, upstream: U, closer: &TunnelCloser)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let client_to_upstream = tokio::io::copy(&mut client_read, &mut upstream_write);
    let upstream_to_client = tokio::io::copy(&mut upstream_read, &mut client_write);

    tokio::select! {
        result = client_to_upstream => match result {
            Ok(n) => debug!("Client leg finished after {} bytes", n),
            Err(e) => debug!("Client->Upstream copy error: {}", e),
        },
        result = upstream_to_client => match result {
            Ok(n) => debug!("Upstream leg finished after {} bytes", n),
            Err(e) => debug!("Upstream->Client copy error: {}", e),
        },
        _ = closer.closed() => debug!("Tunnel closed"),
    }

    closer.close();
}

/// Client leg of an HTTP/2 CONNECT stream
///
/// Reads come from the request body; every write is sent as its own DATA
/// frame on the response body, so nothing sits in a buffer waiting for a
/// flush.
pub struct H2Stream {
    recv: Body,
    send: Option<Sender>,
    pending: Bytes,
}

impl H2Stream {
    pub fn new(recv: Body, send: Sender) -> Self {
        Self {
            recv,
            send: Some(send),
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match Pin::new(&mut self.recv).poll_data(cx) {
                Poll::Ready(Some(Ok(chunk))) => self.pending = chunk,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)))
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = self.pending.len().min(buf.remaining());
        let chunk = self.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let send = match self.send.as_mut() {
            Some(send) => send,
            None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        };

        match send.poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, e)))
            }
            Poll::Pending => return Poll::Pending,
        }

        match send.try_send_data(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Dropping the sender ends the response body
        self.send.take();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_closer_wakes_waiters() {
        let closer = TunnelCloser::new();
        let waiter = {
            let closer = closer.clone();
            tokio::spawn(async move { closer.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        closer.close();
        closer.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn test_closed_after_close_returns_immediately() {
        let closer = TunnelCloser::new();
        closer.close();
        tokio::time::timeout(Duration::from_millis(100), closer.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_relay_copies_both_ways() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (upstream, mut upstream_peer) = tokio::io::duplex(1024);
        let closer = TunnelCloser::new();

        let relay_closer = closer.clone();
        let task = tokio::spawn(async move { relay(client, upstream, &relay_closer).await });

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // One side hanging up tears down the other
        drop(upstream_peer);
        task.await.unwrap();
        assert!(closer.is_closed());
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_external_close_stops_relay() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (upstream, _upstream_peer) = tokio::io::duplex(1024);
        let closer = TunnelCloser::new();

        let relay_closer = closer.clone();
        let task = tokio::spawn(async move { relay(client, upstream, &relay_closer).await });

        closer.close();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_h2_stream_reads_and_writes() {
        let (mut req_tx, req_body) = Body::channel();
        let (resp_tx, mut resp_body) = Body::channel();
        let mut stream = H2Stream::new(req_body, resp_tx);

        req_tx.send_data(Bytes::from_static(b"hello world")).await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        let mut rest = [0u8; 6];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b" world");

        stream.write_all(b"reply").await.unwrap();
        let chunk = resp_body.data().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"reply");

        drop(req_tx);
        let mut tail = Vec::new();
        stream.read_to_end(&mut tail).await.unwrap();
        assert!(tail.is_empty());

        stream.shutdown().await.unwrap();
        assert!(resp_body.data().await.is_none());
    }
}
