//! Pin tracker: bounded, concurrency-limited execution of pin/unpin intents.
//!
//! The tracker is made of:
//! - **Store**: CID → `PinInfo`, the only authoritative record of status
//! - **Admission queues**: one bounded FIFO per operation, rejecting when full
//! - **Worker pools**: `concurrent_pins` pin workers and a single unpin worker
//! - **PinTracker**: the orchestrator wiring them together
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pintracker_core::{Cid, PeerId, Pin, PinTracker, TrackerConfig};
//!
//! let tracker = PinTracker::new(TrackerConfig::default(), peer_id, Arc::new(connector))?;
//! tracker.start().await;
//!
//! let cid: Cid = "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG".parse()?;
//! tracker.track(Pin::everywhere(cid.clone()))?;
//!
//! // Poll or subscribe for progress
//! let info = tracker.status(&cid);
//! println!("{}: {}", info.cid, info.status);
//!
//! // Retry whatever failed
//! let requeued = tracker.recover()?;
//!
//! tracker.shutdown().await;
//! ```

mod pool;
mod queue;
mod runner;
mod store;
mod types;

pub use pool::{EntryHandler, Outcome, PoolStats, WorkerPool};
pub use queue::{admission_queue, AdmissionError, AdmissionQueue, QueueEntry, QueueReceiver};
pub use runner::{PinTracker, UNPIN_WORKERS};
pub use store::{PinInfoStore, PinsGuard};
pub use types::{
    Cid, InvalidIdentifier, PeerId, Pin, PinInfo, PinOperation, PoolStatus, TrackerError,
    TrackerStats, TrackerStatus,
};
