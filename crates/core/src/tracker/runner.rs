//! Pin tracker implementation.
//!
//! Drives CIDs through the pin state machine:
//! - Pin: up to `concurrent_pins` daemon calls in parallel
//! - Unpin: one daemon call at a time, in enqueue order
//! - Admission: bounded queues, rejected intents become error states

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{validate_config, ConfigError, TrackerConfig};
use crate::connector::{ConnectorError, DaemonConnector};
use crate::metrics;

use super::pool::{EntryHandler, Outcome, PoolStats, WorkerPool};
use super::queue::{admission_queue, AdmissionQueue, QueueEntry, QueueReceiver};
use super::store::{PinInfoStore, PinsGuard};
use super::types::{
    Cid, PeerId, Pin, PinInfo, PinOperation, TrackerError, TrackerStats, TrackerStatus,
};

/// Unpins are always processed one by one.
pub const UNPIN_WORKERS: usize = 1;

/// Buffer of the status change broadcast.
const EVENT_BUFFER_SIZE: usize = 1024;

const ERR_UNEXPECTEDLY_PINNED: &str = "the item is unexpectedly pinned on the daemon";
const ERR_UNEXPECTEDLY_UNPINNED: &str = "the item is unexpectedly not pinned on the daemon";

/// Tracks the local pin state of CIDs and drives the daemon towards it.
pub struct PinTracker {
    config: TrackerConfig,
    store: Arc<PinInfoStore>,
    connector: Arc<dyn DaemonConnector>,
    queues: Queues,
    receivers: Mutex<Option<(QueueReceiver, QueueReceiver)>>,
    pin_stats: Arc<PoolStats>,
    unpin_stats: Arc<PoolStats>,

    // Runtime state
    pools: tokio::sync::Mutex<Vec<WorkerPool>>,
    running: AtomicBool,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl PinTracker {
    /// Creates a tracker for `peer`. Workers are not running until
    /// [`start`](Self::start); intents admitted before that wait in the queues.
    pub fn new(
        config: TrackerConfig,
        peer: PeerId,
        connector: Arc<dyn DaemonConnector>,
    ) -> Result<Self, ConfigError> {
        validate_config(&config)?;

        let (pin_queue, pin_rx) = admission_queue(PinOperation::Pin, config.max_pin_queue_size);
        let (unpin_queue, unpin_rx) =
            admission_queue(PinOperation::Unpin, config.max_pin_queue_size);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            store: Arc::new(PinInfoStore::new(peer, EVENT_BUFFER_SIZE)),
            connector,
            queues: Queues {
                pin: pin_queue,
                unpin: unpin_queue,
            },
            receivers: Mutex::new(Some((pin_rx, unpin_rx))),
            pin_stats: Arc::new(PoolStats::default()),
            unpin_stats: Arc::new(PoolStats::default()),
            pools: tokio::sync::Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn peer(&self) -> &PeerId {
        self.store.peer()
    }

    /// Start the worker pools.
    pub async fn start(&self) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("Pin tracker was shut down and cannot be restarted");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Pin tracker already running");
            return;
        }

        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some((pin_rx, unpin_rx)) = receivers else {
            warn!("Pin tracker was shut down and cannot be restarted");
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        info!(
            "Starting pin tracker for peer {} using connector {}",
            self.store.peer(),
            self.connector.name()
        );

        let executor = Arc::new(Executor {
            store: Arc::clone(&self.store),
            queues: self.queues.clone(),
            connector: Arc::clone(&self.connector),
            timeout: self.config.connector_timeout(),
        });

        let pin_pool = WorkerPool::spawn(
            self.config.concurrent_pins,
            pin_rx,
            Arc::clone(&executor),
            Arc::clone(&self.pin_stats),
            &self.shutdown_tx,
        );
        let unpin_pool = WorkerPool::spawn(
            UNPIN_WORKERS,
            unpin_rx,
            executor,
            Arc::clone(&self.unpin_stats),
            &self.shutdown_tx,
        );

        self.pools.lock().await.extend([pin_pool, unpin_pool]);
        info!("Pin tracker started");
    }

    /// Stop admitting work and wait for in-flight daemon calls to finish.
    ///
    /// Entries still waiting in the queues are abandoned and keep their
    /// queued status.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Pin tracker already shut down");
            return;
        }

        info!("Stopping pin tracker");
        let _ = self.shutdown_tx.send(());

        let pools = std::mem::take(&mut *self.pools.lock().await);
        for pool in pools {
            pool.join().await;
        }

        let abandoned = self.queues.pin.len() + self.queues.unpin.len();
        if abandoned > 0 {
            info!("Abandoned {} queued intents", abandoned);
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Pin tracker stopped");
    }

    /// Start tracking a pin.
    ///
    /// Returns the resulting status. A CID already queued, pinning or pinned
    /// is left untouched and its current status is returned.
    pub fn track(&self, pin: Pin) -> Result<TrackerStatus, TrackerError> {
        self.ensure_accepting()?;
        let cid = &pin.cid;

        if pin.is_remote_for(self.store.peer()) {
            return self.track_remote(cid);
        }

        let mut pins = self.store.lock();
        let current = pins.status(cid);
        match current {
            TrackerStatus::PinQueued | TrackerStatus::Pinning | TrackerStatus::Pinned => {
                debug!("Track {}: already {}", cid, current);
                Ok(current)
            }
            _ => self.queues.admit(&mut pins, cid, PinOperation::Pin),
        }
    }

    /// Stop tracking a CID, unpinning it from the daemon.
    ///
    /// A CID already queued for unpinning, unpinning or unpinned (including
    /// unknown CIDs) is left untouched.
    pub fn untrack(&self, cid: &Cid) -> Result<TrackerStatus, TrackerError> {
        self.ensure_accepting()?;

        let mut pins = self.store.lock();
        let current = pins.status(cid);
        match current {
            TrackerStatus::Unpinned | TrackerStatus::UnpinQueued | TrackerStatus::Unpinning => {
                debug!("Untrack {}: already {}", cid, current);
                Ok(current)
            }
            TrackerStatus::Remote => {
                // Nothing is held locally for a remote pin.
                pins.set(cid, TrackerStatus::Unpinned);
                Ok(TrackerStatus::Unpinned)
            }
            _ => self.queues.admit(&mut pins, cid, PinOperation::Unpin),
        }
    }

    /// A pin allocated to other peers. Local data, if any, is released.
    fn track_remote(&self, cid: &Cid) -> Result<TrackerStatus, TrackerError> {
        let mut pins = self.store.lock();
        let current = pins.status(cid);
        match current {
            TrackerStatus::Pinned
            | TrackerStatus::PinQueued
            | TrackerStatus::Pinning
            | TrackerStatus::PinError => {
                info!("{} is allocated to other peers, unpinning local copy", cid);
                self.queues.admit(&mut pins, cid, PinOperation::Unpin)
            }
            TrackerStatus::UnpinQueued
            | TrackerStatus::Unpinning
            | TrackerStatus::UnpinError
            | TrackerStatus::Remote => Ok(current),
            TrackerStatus::Unpinned => {
                pins.set(cid, TrackerStatus::Remote);
                Ok(TrackerStatus::Remote)
            }
        }
    }

    /// Status of one CID. Unknown CIDs are reported as unpinned.
    pub fn status(&self, cid: &Cid) -> PinInfo {
        self.store.get(cid)
    }

    /// Snapshot of every tracked CID, ordered by CID.
    pub fn status_all(&self) -> Vec<PinInfo> {
        self.store.snapshot()
    }

    /// Re-queue every CID in an error state.
    ///
    /// Returns how many were re-queued. Entries rejected by admission control
    /// stay in their error state.
    pub fn recover(&self) -> Result<usize, TrackerError> {
        self.ensure_accepting()?;

        let errored = self.store.filter(|status| status.is_error());
        let total = errored.len();
        let mut requeued = 0;

        for info in errored {
            match self.requeue(&info.cid) {
                Ok(true) => requeued += 1,
                Ok(false) => {}
                Err(TrackerError::Admission(e)) => {
                    debug!("Recover {}: {}", info.cid, e);
                }
                Err(e) => return Err(e),
            }
        }

        info!("Recovered {} of {} errored entries", requeued, total);
        Ok(requeued)
    }

    /// Re-queue one CID if it is in an error state.
    pub fn recover_cid(&self, cid: &Cid) -> Result<PinInfo, TrackerError> {
        self.ensure_accepting()?;
        self.requeue(cid)?;
        Ok(self.store.get(cid))
    }

    /// Remove a CID from the store.
    ///
    /// Refused while an operation for the CID is queued or running.
    pub fn forget(&self, cid: &Cid) -> Result<Option<PinInfo>, TrackerError> {
        let mut pins = self.store.lock();
        let status = pins.status(cid);
        if status.is_queued() || status.is_in_progress() || pins.in_flight(cid).is_some() {
            return Err(TrackerError::InvalidState {
                cid: cid.clone(),
                status,
                operation: "forget".to_string(),
            });
        }
        Ok(pins.remove(cid))
    }

    /// Reconcile one CID with the daemon's pin set.
    pub async fn sync(&self, cid: &Cid) -> Result<PinInfo, TrackerError> {
        let pinned = call_with_timeout(
            self.config.connector_timeout(),
            self.connector.is_pinned(cid),
        )
        .await?;
        self.reconcile(cid, pinned);
        Ok(self.store.get(cid))
    }

    /// Reconcile every tracked CID with the daemon's pin set.
    ///
    /// Returns the entries whose status changed.
    pub async fn sync_all(&self) -> Result<Vec<PinInfo>, TrackerError> {
        let pinned: HashSet<Cid> =
            call_with_timeout(self.config.connector_timeout(), self.connector.pin_ls()).await?;

        let changed: Vec<PinInfo> = self
            .store
            .snapshot()
            .into_iter()
            .filter_map(|info| self.reconcile(&info.cid, pinned.contains(&info.cid)))
            .collect();

        if !changed.is_empty() {
            info!("Sync updated {} entries", changed.len());
        }
        Ok(changed)
    }

    /// Receive every status change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PinInfo> {
        self.store.subscribe()
    }

    /// Current runtime statistics.
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            running: self.running.load(Ordering::Relaxed),
            tracked: self.store.len(),
            pin_pool: self.pin_stats.to_status(
                PinOperation::Pin,
                self.config.concurrent_pins,
                self.queues.pin.len(),
                self.queues.pin.capacity(),
            ),
            unpin_pool: self.unpin_stats.to_status(
                PinOperation::Unpin,
                UNPIN_WORKERS,
                self.queues.unpin.len(),
                self.queues.unpin.capacity(),
            ),
        }
    }

    fn ensure_accepting(&self) -> Result<(), TrackerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TrackerError::ShuttingDown);
        }
        Ok(())
    }

    /// Re-admits `cid` if it is errored. `Ok(false)` when it is not.
    ///
    /// A rejected re-admission leaves the entry and its error untouched.
    fn requeue(&self, cid: &Cid) -> Result<bool, TrackerError> {
        let mut pins = self.store.lock();
        let Some(operation) = pins.status(cid).recovery_operation() else {
            return Ok(false);
        };

        self.queues.admit(&mut pins, cid, operation)?;
        metrics::RECOVERIES
            .with_label_values(&[operation.as_str()])
            .inc();
        Ok(true)
    }

    /// Applies the daemon's view of `cid` to a stored entry. Queued and
    /// remote entries are left alone. Returns the new info on change.
    fn reconcile(&self, cid: &Cid, daemon_pinned: bool) -> Option<PinInfo> {
        let mut pins = self.store.lock();
        let status = pins.get(cid)?.status;

        let changed = if daemon_pinned {
            match status {
                TrackerStatus::Pinning | TrackerStatus::PinError => {
                    Some(pins.set(cid, TrackerStatus::Pinned))
                }
                TrackerStatus::Unpinned => Some(pins.set_error(
                    cid,
                    TrackerStatus::UnpinError,
                    ERR_UNEXPECTEDLY_PINNED,
                )),
                _ => None,
            }
        } else {
            match status {
                TrackerStatus::Pinned => Some(pins.set_error(
                    cid,
                    TrackerStatus::PinError,
                    ERR_UNEXPECTEDLY_UNPINNED,
                )),
                TrackerStatus::Unpinning | TrackerStatus::UnpinError => {
                    Some(pins.set(cid, TrackerStatus::Unpinned))
                }
                _ => None,
            }
        };

        if let Some(ref info) = changed {
            debug!("Sync {}: {} -> {}", cid, status, info.status);
        }
        changed
    }
}

/// Producer sides of the pin and unpin queues.
#[derive(Clone)]
struct Queues {
    pin: AdmissionQueue,
    unpin: AdmissionQueue,
}

impl Queues {
    fn get(&self, operation: PinOperation) -> &AdmissionQueue {
        match operation {
            PinOperation::Pin => &self.pin,
            PinOperation::Unpin => &self.unpin,
        }
    }

    /// Moves `cid` towards `operation`.
    ///
    /// While a daemon call for `cid` is running nothing is enqueued: the new
    /// intent is recorded in the status and dispatched when the call returns.
    /// A CID has at most one waiting entry per queue. On rejection the CID
    /// is moved to the operation's error state, unless it is already there.
    fn admit(
        &self,
        pins: &mut PinsGuard<'_>,
        cid: &Cid,
        operation: PinOperation,
    ) -> Result<TrackerStatus, TrackerError> {
        let previous = pins.status(cid);

        if let Some(running) = pins.in_flight(cid) {
            let status = if running == operation {
                operation.in_progress_status()
            } else {
                operation.queued_status()
            };
            pins.set(cid, status);
            debug!(
                "Deferred {} of {} behind running {} (was {})",
                operation, cid, running, previous
            );
            return Ok(status);
        }

        if pins.is_enqueued(cid, operation) {
            pins.set(cid, operation.queued_status());
            debug!("{} of {} already waiting in queue (was {})", operation, cid, previous);
            return Ok(operation.queued_status());
        }

        match self.get(operation).try_enqueue(cid) {
            Ok(()) => {
                pins.mark_enqueued(cid, operation);
                pins.set(cid, operation.queued_status());
                metrics::INTENTS_QUEUED
                    .with_label_values(&[operation.as_str()])
                    .inc();
                debug!("Queued {} for {} (was {})", cid, operation, previous);
                Ok(operation.queued_status())
            }
            Err(e) => {
                metrics::QUEUE_REJECTIONS
                    .with_label_values(&[operation.as_str()])
                    .inc();
                warn!("Rejected {} of {}: {}", operation, cid, e);
                if previous != operation.error_status() {
                    pins.set_error(cid, operation.error_status(), e.to_string());
                }
                Err(e.into())
            }
        }
    }
}

/// Runs dequeued intents against the daemon.
struct Executor {
    store: Arc<PinInfoStore>,
    queues: Queues,
    connector: Arc<dyn DaemonConnector>,
    timeout: Duration,
}

impl Executor {
    /// Claims `entry` for execution. Fails when the entry is stale or another
    /// call for the CID is still running.
    fn claim(&self, entry: &QueueEntry) -> bool {
        let operation = entry.operation;
        let cid = &entry.cid;
        let mut pins = self.store.lock();
        pins.mark_dequeued(cid, operation);

        let status = pins.status(cid);
        if status != operation.queued_status() || pins.in_flight(cid).is_some() {
            debug!(
                "Skipping stale {} entry for {}: status is now {}",
                operation, cid, status
            );
            return false;
        }

        pins.begin(cid, operation);
        pins.set(cid, operation.in_progress_status());
        true
    }

    /// Records the outcome of a finished call, or dispatches the intent that
    /// arrived while it was running.
    fn complete(&self, cid: &Cid, operation: PinOperation, error: Option<String>) {
        let mut pins = self.store.lock();
        pins.finish(cid);

        let status = pins.status(cid);
        if status == operation.in_progress_status() {
            match error {
                None => {
                    pins.set(cid, operation.done_status());
                    info!("{} {} succeeded", operation, cid);
                }
                Some(error) => {
                    pins.set_error(cid, operation.error_status(), error);
                }
            }
            return;
        }

        let next = operation.opposite();
        if status == next.queued_status() {
            debug!("{} {} finished, dispatching waiting {}", operation, cid, next);
            if let Err(e) = self.queues.admit(&mut pins, cid, next) {
                warn!("Could not dispatch {} of {}: {}", next, cid, e);
            }
        } else {
            debug!("{} {} finished but was superseded ({})", operation, cid, status);
        }
    }
}

#[async_trait]
impl EntryHandler for Executor {
    async fn handle(&self, entry: QueueEntry) -> Outcome {
        if !self.claim(&entry) {
            return Outcome::Skipped;
        }

        let operation = entry.operation;
        let cid = &entry.cid;

        let waited = Utc::now() - entry.queued_at;
        debug!(
            "Running {} for {} after {}ms in queue",
            operation,
            cid,
            waited.num_milliseconds()
        );

        let label = operation.as_str();
        metrics::OPERATIONS_IN_FLIGHT.with_label_values(&[label]).inc();
        let timer = metrics::OPERATION_DURATION
            .with_label_values(&[label])
            .start_timer();

        let result = match operation {
            PinOperation::Pin => call_with_timeout(self.timeout, self.connector.pin(cid)).await,
            PinOperation::Unpin => {
                call_with_timeout(self.timeout, self.connector.unpin(cid)).await
            }
        };

        timer.observe_duration();
        metrics::OPERATIONS_IN_FLIGHT.with_label_values(&[label]).dec();

        match result {
            Ok(()) => {
                metrics::OPERATIONS_TOTAL
                    .with_label_values(&[label, "success"])
                    .inc();
                self.complete(cid, operation, None);
                Outcome::Done
            }
            Err(e) => {
                let result_label = match e {
                    ConnectorError::Timeout(_) => "timeout",
                    _ => "error",
                };
                metrics::OPERATIONS_TOTAL
                    .with_label_values(&[label, result_label])
                    .inc();
                warn!("{} {} failed: {}", operation, cid, e);
                self.complete(cid, operation, Some(e.to_string()));
                Outcome::Failed
            }
        }
    }
}

/// Bounds a connector call; expiry is reported as [`ConnectorError::Timeout`].
async fn call_with_timeout<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ConnectorError>>,
) -> Result<T, ConnectorError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ConnectorError::Timeout(timeout))?
}
