//! Mock daemon connector for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

use crate::connector::{ConnectorError, DaemonConnector};
use crate::tracker::{Cid, PinOperation};

/// A recorded daemon call for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub operation: PinOperation,
    pub cid: Cid,
    /// Whether the call succeeded.
    pub success: bool,
}

/// Current and peak number of concurrent calls.
#[derive(Debug, Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Concurrency {
    fn enter(&self) -> ConcurrencyGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ConcurrencyGuard(self)
    }
}

/// Leaves the counter even when the call is cancelled by a timeout.
struct ConcurrencyGuard<'a>(&'a Concurrency);

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock implementation of the DaemonConnector trait.
///
/// Provides controllable behavior for testing:
/// - Keep an in-memory daemon pin set
/// - Record every pin/unpin call
/// - Fail calls for chosen CIDs
/// - Simulate slow calls, or hold every call until released
/// - Report the peak number of concurrent pins and unpins
///
/// Clones share state, so a test can keep one handle and give the other to
/// the tracker.
///
/// # Example
///
/// ```rust,ignore
/// use pintracker_core::testing::MockConnector;
///
/// let connector = MockConnector::new();
/// connector.fail_cid(&cid, "context canceled").await;
/// connector.hold();
///
/// // ... track pins ...
///
/// connector.release();
/// assert!(connector.peak_concurrent_pins() <= 10);
/// ```
#[derive(Debug, Clone)]
pub struct MockConnector {
    /// CIDs pinned on the simulated daemon.
    pinned: Arc<RwLock<HashSet<Cid>>>,
    /// Recorded calls, in completion order.
    calls: Arc<RwLock<Vec<RecordedCall>>>,
    /// Calls for these CIDs fail with the given error.
    failures: Arc<RwLock<HashMap<Cid, ConnectorError>>>,
    /// Simulated call duration in milliseconds.
    call_duration_ms: Arc<RwLock<u64>>,
    /// While true, calls wait before doing anything.
    hold: Arc<watch::Sender<bool>>,
    pins: Arc<Concurrency>,
    unpins: Arc<Concurrency>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Create a new mock connector.
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            pinned: Arc::new(RwLock::new(HashSet::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(RwLock::new(HashMap::new())),
            call_duration_ms: Arc::new(RwLock::new(0)),
            hold: Arc::new(hold),
            pins: Arc::new(Concurrency::default()),
            unpins: Arc::new(Concurrency::default()),
        }
    }

    /// Get all recorded calls.
    pub async fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.read().await.clone()
    }

    /// Number of calls made for `operation` on `cid`.
    pub async fn call_count(&self, operation: PinOperation, cid: &Cid) -> usize {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.operation == operation && &c.cid == cid)
            .count()
    }

    /// CIDs passed to `operation`, in completion order.
    pub async fn cids_for(&self, operation: PinOperation) -> Vec<Cid> {
        self.calls
            .read()
            .await
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.cid.clone())
            .collect()
    }

    /// Make every call for `cid` fail with a daemon error.
    pub async fn fail_cid(&self, cid: &Cid, message: &str) {
        self.failures
            .write()
            .await
            .insert(cid.clone(), ConnectorError::Daemon(message.to_string()));
    }

    /// Clear all configured failures.
    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    /// Set the simulated call duration.
    pub async fn set_call_duration(&self, duration: Duration) {
        *self.call_duration_ms.write().await = duration.as_millis() as u64;
    }

    /// Pretend the daemon holds `cid` pinned.
    pub async fn set_daemon_pinned(&self, cid: &Cid, pinned: bool) {
        let mut set = self.pinned.write().await;
        if pinned {
            set.insert(cid.clone());
        } else {
            set.remove(cid);
        }
    }

    pub async fn daemon_has(&self, cid: &Cid) -> bool {
        self.pinned.read().await.contains(cid)
    }

    /// Make calls wait until [`release`](Self::release).
    pub fn hold(&self) {
        self.hold.send_replace(true);
    }

    /// Let held and future calls proceed.
    pub fn release(&self) {
        self.hold.send_replace(false);
    }

    /// Pin calls currently running.
    pub fn concurrent_pins(&self) -> usize {
        self.pins.current.load(Ordering::SeqCst)
    }

    /// Highest number of pin calls seen running at once.
    pub fn peak_concurrent_pins(&self) -> usize {
        self.pins.peak.load(Ordering::SeqCst)
    }

    /// Highest number of unpin calls seen running at once.
    pub fn peak_concurrent_unpins(&self) -> usize {
        self.unpins.peak.load(Ordering::SeqCst)
    }

    async fn run(&self, operation: PinOperation, cid: &Cid) -> Result<(), ConnectorError> {
        let concurrency = match operation {
            PinOperation::Pin => &self.pins,
            PinOperation::Unpin => &self.unpins,
        };
        let _guard = concurrency.enter();

        let mut hold_rx = self.hold.subscribe();
        let _ = hold_rx.wait_for(|held| !*held).await;

        let duration_ms = *self.call_duration_ms.read().await;
        if duration_ms > 0 {
            tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        }

        let failure = self.failures.read().await.get(cid).cloned();
        if failure.is_none() {
            let mut pinned = self.pinned.write().await;
            match operation {
                PinOperation::Pin => pinned.insert(cid.clone()),
                PinOperation::Unpin => pinned.remove(cid),
            };
        }

        self.calls.write().await.push(RecordedCall {
            operation,
            cid: cid.clone(),
            success: failure.is_none(),
        });

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DaemonConnector for MockConnector {
    fn name(&self) -> &str {
        "mock"
    }

    async fn pin(&self, cid: &Cid) -> Result<(), ConnectorError> {
        self.run(PinOperation::Pin, cid).await
    }

    async fn unpin(&self, cid: &Cid) -> Result<(), ConnectorError> {
        self.run(PinOperation::Unpin, cid).await
    }

    async fn pin_ls(&self) -> Result<HashSet<Cid>, ConnectorError> {
        Ok(self.pinned.read().await.clone())
    }
}
