//! Byte Metering
//!
//! Counts bytes flowing through a stream and turns the running total into
//! periodic ledger debits. The I/O path only touches an atomic counter; a
//! background task swaps it to zero on every tick and hands the batch to a
//! debit callback. Stopping the meter performs one last flush, so no byte
//! that crossed the stream goes unbilled.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::ledger::LedgerError;

/// Default flush period for tunnel meters
pub const DEFAULT_METER_INTERVAL: Duration = Duration::from_secs(1);

/// Shared byte accumulator
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: u64) {
        if n > 0 {
            self.0.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Swap the count to zero and return what was accumulated
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }

    pub fn pending(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Stream wrapper adding every byte read or written to a [`ByteCounter`]
#[derive(Debug)]
pub struct MeteredStream<S> {
    inner: S,
    counter: ByteCounter,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, counter: ByteCounter) -> Self {
        Self { inner, counter }
    }

    pub fn counter(&self) -> &ByteCounter {
        &self.counter
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.counter.add((buf.filled().len() - before) as u64);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.counter.add(n as u64);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Periodic flusher for a [`ByteCounter`]
#[derive(Debug)]
pub struct Meter {
    counter: ByteCounter,
    interval: Duration,
}

impl Meter {
    pub fn new(interval: Duration) -> Self {
        Self {
            counter: ByteCounter::new(),
            interval,
        }
    }

    pub fn counter(&self) -> ByteCounter {
        self.counter.clone()
    }

    /// Wrap `stream` so its traffic is counted by this meter
    pub fn wrap<S>(&self, stream: S) -> MeteredStream<S> {
        MeteredStream::new(stream, self.counter())
    }

    /// Spawn the flush task. `debit` receives each non-empty batch; a failed
    /// debit is logged and the callback decides how to react to it.
    pub fn start<F, Fut>(self, mut debit: F) -> MeterHandle
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), LedgerError>> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let counter = self.counter;
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => flush(&counter, &mut debit).await,
                    // Fires on an explicit stop or when the handle is dropped
                    _ = &mut stop_rx => break,
                }
            }

            flush(&counter, &mut debit).await;
        });

        MeterHandle {
            stop: Some(stop_tx),
            task,
        }
    }
}

async fn flush<F, Fut>(counter: &ByteCounter, debit: &mut F)
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<(), LedgerError>>,
{
    let n = counter.take();
    if n == 0 {
        return;
    }
    if let Err(e) = debit(n).await {
        warn!("Meter debit of {} bytes failed: {}", n, e);
    }
}

/// Running meter task
#[derive(Debug)]
pub struct MeterHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MeterHandle {
    /// Stop the meter and wait for its final flush
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            debug!("Meter task ended abnormally: {}", e);
        }
    }
}
