//! Background shipping of telemetry to remote sinks.
//!
//! # Data Flow
//! ```text
//! request path ──try_send──▶ bounded queue ──recv_many──▶ worker ──push──▶ Sink
//!      │                                                   │
//!      └── queue full ──┐                 push failed ─────┤
//!                       ▼                                  ▼
//!                  fallback buffer (bounded, oldest evicted first)
//! ```
//!
//! # Design Decisions
//! - Enqueue never waits; a full queue diverts the item instead
//! - One warning per outage, one info line on recovery
//! - Failures are counted, never returned to the producer

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::ExportConfig;

/// Why a push to a sink did not land.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("sink answered with status {0}")]
    Status(u16),

    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("push timed out after {0:?}")]
    Timeout(Duration),
}

/// Remote destination for a batch of telemetry items.
#[async_trait]
pub trait Sink<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    async fn push(&self, batch: &[T]) -> Result<(), ExportError>;
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    /// Items acknowledged by the sink.
    pub exported: u64,
    /// Items in batches the sink rejected or never answered.
    pub failed: u64,
    /// Items that never reached the worker because the queue was full.
    pub dropped: u64,
}

enum Command<T> {
    Item(T),
    Flush(oneshot::Sender<()>),
}

struct Shared<T> {
    exported: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    fallback: Mutex<VecDeque<T>>,
    fallback_capacity: usize,
}

impl<T> Shared<T> {
    fn stats(&self) -> ExportStats {
        ExportStats {
            exported: self.exported.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn fallback(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.fallback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stash(&self, items: impl IntoIterator<Item = T>) {
        if self.fallback_capacity == 0 {
            return;
        }
        let mut fallback = self.fallback();
        for item in items {
            if fallback.len() == self.fallback_capacity {
                fallback.pop_front();
            }
            fallback.push_back(item);
        }
    }
}

/// Handle to a background export worker.
///
/// Cloning shares the queue; the worker stops once every handle is dropped
/// and the queue has drained.
pub struct Exporter<T> {
    tx: mpsc::Sender<Command<T>>,
    shared: Arc<Shared<T>>,
    sink_name: &'static str,
}

impl<T> Clone for Exporter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
            sink_name: self.sink_name,
        }
    }
}

impl<T> std::fmt::Debug for Exporter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("sink", &self.sink_name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T> Exporter<T>
where
    T: Send + Sync + 'static,
{
    /// Start a worker shipping to `sink`. Must be called inside a Tokio runtime.
    pub fn spawn<S>(sink: S, config: &ExportConfig) -> Self
    where
        S: Sink<T>,
    {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            exported: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            fallback: Mutex::new(VecDeque::new()),
            fallback_capacity: config.fallback_capacity,
        });
        let sink_name = sink.name();

        let worker = Worker {
            rx,
            sink,
            shared: Arc::clone(&shared),
            batch_size: config.batch_size.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
            healthy: true,
        };
        tokio::spawn(worker.run());

        Self {
            tx,
            shared,
            sink_name,
        }
    }

    /// Queue one item. Never waits and never fails the caller.
    pub fn export(&self, item: T) {
        let rejected = match self.tx.try_send(Command::Item(item)) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(command)) => command,
            Err(mpsc::error::TrySendError::Closed(command)) => command,
        };
        if let Command::Item(item) = rejected {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            self.shared.stash([item]);
            tracing::debug!(sink = self.sink_name, "Export queue full, item moved to fallback");
        }
    }

    /// Wait until everything queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

impl<T> Exporter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Copy of the items held in the local fallback buffer, oldest first.
    pub fn fallback(&self) -> Vec<T> {
        self.shared.fallback().iter().cloned().collect()
    }
}

impl<T> Exporter<T> {
    pub fn stats(&self) -> ExportStats {
        self.shared.stats()
    }

    pub fn sink_name(&self) -> &'static str {
        self.sink_name
    }

    pub fn fallback_len(&self) -> usize {
        self.shared.fallback().len()
    }
}

struct Worker<T, S> {
    rx: mpsc::Receiver<Command<T>>,
    sink: S,
    shared: Arc<Shared<T>>,
    batch_size: usize,
    timeout: Duration,
    healthy: bool,
}

impl<T, S> Worker<T, S>
where
    T: Send + Sync + 'static,
    S: Sink<T>,
{
    async fn run(mut self) {
        let mut commands = Vec::with_capacity(self.batch_size);
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut waiters = Vec::new();

        while self.rx.recv_many(&mut commands, self.batch_size).await > 0 {
            for command in commands.drain(..) {
                match command {
                    Command::Item(item) => batch.push(item),
                    Command::Flush(done) => waiters.push(done),
                }
            }

            if !batch.is_empty() {
                self.deliver(std::mem::take(&mut batch)).await;
            }
            for done in waiters.drain(..) {
                let _ = done.send(());
            }
        }

        tracing::debug!(sink = self.sink.name(), "Export worker stopped");
    }

    async fn deliver(&mut self, batch: Vec<T>) {
        let count = batch.len() as u64;
        let result = match tokio::time::timeout(self.timeout, self.sink.push(&batch)).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => {
                self.shared.exported.fetch_add(count, Ordering::Relaxed);
                if !self.healthy {
                    self.healthy = true;
                    tracing::info!(sink = self.sink.name(), "Telemetry sink recovered");
                }
            }
            Err(err) => {
                self.shared.failed.fetch_add(count, Ordering::Relaxed);
                if self.healthy {
                    self.healthy = false;
                    tracing::warn!(
                        sink = self.sink.name(),
                        error = %err,
                        failed = self.shared.stats().failed,
                        "Telemetry sink unavailable, keeping records locally"
                    );
                } else {
                    tracing::debug!(sink = self.sink.name(), error = %err, "Telemetry push failed");
                }
                self.shared.stash(batch);
            }
        }
    }
}

/// In-process sink that keeps every accepted item. Can be switched into a
/// failing mode to simulate an outage.
pub struct MemorySink<T> {
    items: Arc<Mutex<Vec<T>>>,
    failing: Arc<AtomicBool>,
}

impl<T> Clone for MemorySink<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            failing: Arc::clone(&self.failing),
        }
    }
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl<T> Sink<T> for MemorySink<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, batch: &[T]) -> Result<(), ExportError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ExportError::Status(503));
        }
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(batch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(queue_capacity: usize, fallback_capacity: usize) -> ExportConfig {
        ExportConfig {
            timeout_ms: 500,
            queue_capacity,
            batch_size: 8,
            fallback_capacity,
        }
    }

    struct StalledSink;

    #[async_trait]
    impl Sink<u32> for StalledSink {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn push(&self, _batch: &[u32]) -> Result<(), ExportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_items_reach_sink_after_flush() {
        let sink = MemorySink::new();
        let exporter = Exporter::spawn(sink.clone(), &config(64, 16));

        for i in 0..20u32 {
            exporter.export(i);
        }
        exporter.flush().await;

        assert_eq!(sink.items(), (0..20).collect::<Vec<_>>());
        assert_eq!(
            exporter.stats(),
            ExportStats {
                exported: 20,
                failed: 0,
                dropped: 0
            }
        );
        assert_eq!(exporter.fallback_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_pushes_are_counted_and_kept() {
        let sink = MemorySink::new();
        sink.set_failing(true);
        let exporter = Exporter::spawn(sink.clone(), &config(64, 16));

        for i in 0..5u32 {
            exporter.export(i);
        }
        exporter.flush().await;

        assert!(sink.items().is_empty());
        assert_eq!(exporter.stats().failed, 5);
        assert_eq!(exporter.fallback(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_fallback_evicts_oldest() {
        let sink = MemorySink::new();
        sink.set_failing(true);
        let exporter = Exporter::spawn(sink.clone(), &config(64, 3));

        for i in 0..6u32 {
            exporter.export(i);
        }
        exporter.flush().await;

        assert_eq!(exporter.fallback(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_recovers_after_outage() {
        let sink = MemorySink::new();
        sink.set_failing(true);
        let exporter = Exporter::spawn(sink.clone(), &config(64, 16));

        exporter.export(1u32);
        exporter.flush().await;
        sink.set_failing(false);
        exporter.export(2);
        exporter.flush().await;

        assert_eq!(sink.items(), vec![2]);
        let stats = exporter.stats();
        assert_eq!((stats.exported, stats.failed), (1, 1));
    }

    #[tokio::test]
    async fn test_full_queue_never_blocks_producer() {
        let exporter = Exporter::spawn(StalledSink, &config(2, 100));

        // The worker takes the first batch and hangs; the rest piles up.
        for i in 0..50u32 {
            exporter.export(i);
        }

        let stats = exporter.stats();
        assert!(stats.dropped > 0);
        assert_eq!(exporter.fallback_len() as u64, stats.dropped);
    }

    #[tokio::test]
    async fn test_stalled_sink_times_out() {
        let exporter = Exporter::spawn(
            StalledSink,
            &ExportConfig {
                timeout_ms: 20,
                ..config(16, 16)
            },
        );

        exporter.export(7u32);
        exporter.flush().await;

        assert_eq!(exporter.stats().failed, 1);
        assert_eq!(exporter.fallback(), vec![7]);
    }
}
