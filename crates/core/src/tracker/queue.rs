//! Bounded admission queue for pin and unpin intents.
//!
//! Enqueueing never waits: when the queue is at capacity the intent is
//! rejected on the spot, so a slow daemon cannot stall callers.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use super::types::{Cid, PinOperation};

/// Admission failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The queue is at capacity.
    #[error("{operation} queue full (capacity {capacity})")]
    Full {
        operation: PinOperation,
        capacity: usize,
    },

    /// The consuming side is gone.
    #[error("{operation} queue closed")]
    Closed { operation: PinOperation },
}

/// An intent waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub cid: Cid,
    pub operation: PinOperation,
    pub queued_at: DateTime<Utc>,
}

/// Producer side of an admission queue.
#[derive(Debug, Clone)]
pub struct AdmissionQueue {
    operation: PinOperation,
    tx: mpsc::Sender<QueueEntry>,
}

/// Consumer side of an admission queue.
#[derive(Debug)]
pub struct QueueReceiver {
    operation: PinOperation,
    rx: mpsc::Receiver<QueueEntry>,
}

/// Creates a queue for `operation` holding at most `capacity` entries.
///
/// `capacity` must be greater than zero.
pub fn admission_queue(
    operation: PinOperation,
    capacity: usize,
) -> (AdmissionQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        AdmissionQueue { operation, tx },
        QueueReceiver { operation, rx },
    )
}

impl AdmissionQueue {
    pub fn operation(&self) -> PinOperation {
        self.operation
    }

    /// Adds an intent for `cid`, failing immediately when full.
    pub fn try_enqueue(&self, cid: &Cid) -> Result<(), AdmissionError> {
        let entry = QueueEntry {
            cid: cid.clone(),
            operation: self.operation,
            queued_at: Utc::now(),
        };
        self.tx.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AdmissionError::Full {
                operation: self.operation,
                capacity: self.capacity(),
            },
            mpsc::error::TrySendError::Closed(_) => AdmissionError::Closed {
                operation: self.operation,
            },
        })
    }

    /// Entries currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl QueueReceiver {
    pub fn operation(&self) -> PinOperation {
        self.operation
    }

    /// Waits for the next entry. `None` once every producer is dropped and
    /// the queue is drained.
    pub async fn dequeue(&mut self) -> Option<QueueEntry> {
        self.rx.recv().await
    }
}
