//! Fixed-size worker pools draining an admission queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::queue::{QueueEntry, QueueReceiver};
use super::types::{PinOperation, PoolStatus};

/// Result of handling one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The connector call succeeded.
    Done,
    /// The connector call failed or timed out.
    Failed,
    /// The entry was stale and no call was made.
    Skipped,
}

/// Executes dequeued entries. Implementations must not panic on connector
/// failures; they record them and return [`Outcome::Failed`].
#[async_trait]
pub trait EntryHandler: Send + Sync + 'static {
    async fn handle(&self, entry: QueueEntry) -> Outcome;
}

/// Tracks statistics for a worker pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    active: AtomicU64,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
}

impl PoolStats {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed) as usize
    }

    pub fn to_status(
        &self,
        operation: PinOperation,
        workers: usize,
        queued: usize,
        capacity: usize,
    ) -> PoolStatus {
        PoolStatus {
            name: operation.as_str().to_string(),
            workers,
            active: self.active(),
            queued,
            capacity,
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }
}

/// A set of worker tasks sharing one queue receiver.
pub struct WorkerPool {
    operation: PinOperation,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers consuming `receiver`.
    ///
    /// Workers stop when `shutdown` fires or the queue closes. A worker in the
    /// middle of a connector call finishes it before observing the signal.
    pub fn spawn<H: EntryHandler>(
        size: usize,
        receiver: QueueReceiver,
        handler: Arc<H>,
        stats: Arc<PoolStats>,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let operation = receiver.operation();
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..size)
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let handler = Arc::clone(&handler);
                let stats = Arc::clone(&stats);
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(run_worker(
                    operation,
                    worker_id,
                    receiver,
                    handler,
                    stats,
                    shutdown_rx,
                ))
            })
            .collect();

        info!("Started {} {} workers", size, operation);
        Self { operation, handles }
    }

    pub fn operation(&self) -> PinOperation {
        self.operation
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to exit.
    pub async fn join(self) {
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!("{} worker terminated abnormally: {}", self.operation, e);
            }
        }
    }
}

async fn run_worker<H: EntryHandler>(
    operation: PinOperation,
    worker_id: usize,
    receiver: Arc<Mutex<QueueReceiver>>,
    handler: Arc<H>,
    stats: Arc<PoolStats>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("{} worker {} started", operation, worker_id);
    loop {
        let entry = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("{} worker {} received shutdown signal", operation, worker_id);
                break;
            }
            entry = next_entry(&receiver) => entry,
        };

        let Some(entry) = entry else {
            debug!("{} queue closed", operation);
            break;
        };

        stats.active.fetch_add(1, Ordering::Relaxed);
        let outcome = handler.handle(entry).await;
        stats.active.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Outcome::Done => {
                stats.total_processed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failed => {
                stats.total_processed.fetch_add(1, Ordering::Relaxed);
                stats.total_failed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Skipped => {}
        }
    }
    debug!("{} worker {} stopped", operation, worker_id);
}

async fn next_entry(receiver: &Mutex<QueueReceiver>) -> Option<QueueEntry> {
    receiver.lock().await.dequeue().await
}
