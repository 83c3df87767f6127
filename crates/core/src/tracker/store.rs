//! PinInfo store: the single authoritative record of per-CID status.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::broadcast;

use super::types::{Cid, PeerId, PinInfo, PinOperation, TrackerStatus};

/// Mapping from CID to tracking state.
///
/// Every read and write goes through a short critical section on one mutex.
/// Callers must never hold a [`PinsGuard`] across an `.await`.
pub struct PinInfoStore {
    peer: PeerId,
    pins: Mutex<Pins>,
    events: broadcast::Sender<PinInfo>,
}

#[derive(Default)]
struct Pins {
    entries: HashMap<Cid, PinInfo>,
    /// Daemon call currently running per CID. At most one.
    in_flight: HashMap<Cid, PinOperation>,
    /// Queue entries not yet dequeued, per CID and operation.
    enqueued: HashSet<(Cid, PinOperation)>,
}

/// Exclusive access to the store for a compound check-and-update.
pub struct PinsGuard<'a> {
    pins: MutexGuard<'a, Pins>,
    peer: &'a PeerId,
    events: &'a broadcast::Sender<PinInfo>,
}

impl PinsGuard<'_> {
    /// Current status, `Unpinned` when the CID is unknown.
    pub fn status(&self, cid: &Cid) -> TrackerStatus {
        self.pins
            .entries
            .get(cid)
            .map(|info| info.status)
            .unwrap_or(TrackerStatus::Unpinned)
    }

    pub fn get(&self, cid: &Cid) -> Option<&PinInfo> {
        self.pins.entries.get(cid)
    }

    /// The daemon call running for `cid`, if any.
    pub fn in_flight(&self, cid: &Cid) -> Option<PinOperation> {
        self.pins.in_flight.get(cid).copied()
    }

    /// Records that a daemon call for `cid` has started.
    pub fn begin(&mut self, cid: &Cid, operation: PinOperation) {
        self.pins.in_flight.insert(cid.clone(), operation);
    }

    /// Records that the daemon call for `cid` has returned.
    pub fn finish(&mut self, cid: &Cid) -> Option<PinOperation> {
        self.pins.in_flight.remove(cid)
    }

    /// Whether `cid` already has an entry waiting in the `operation` queue.
    pub fn is_enqueued(&self, cid: &Cid, operation: PinOperation) -> bool {
        self.pins.enqueued.contains(&(cid.clone(), operation))
    }

    pub fn mark_enqueued(&mut self, cid: &Cid, operation: PinOperation) {
        self.pins.enqueued.insert((cid.clone(), operation));
    }

    /// Called when a worker takes the entry off its queue.
    pub fn mark_dequeued(&mut self, cid: &Cid, operation: PinOperation) {
        self.pins.enqueued.remove(&(cid.clone(), operation));
    }

    /// Sets a non-error status, clearing any recorded error.
    pub fn set(&mut self, cid: &Cid, status: TrackerStatus) -> PinInfo {
        self.write(cid, status, None)
    }

    /// Sets an error status with its reason.
    pub fn set_error(
        &mut self,
        cid: &Cid,
        status: TrackerStatus,
        error: impl Into<String>,
    ) -> PinInfo {
        self.write(cid, status, Some(error.into()))
    }

    pub fn remove(&mut self, cid: &Cid) -> Option<PinInfo> {
        self.pins.entries.remove(cid)
    }

    fn write(&mut self, cid: &Cid, status: TrackerStatus, error: Option<String>) -> PinInfo {
        let info = self
            .pins
            .entries
            .entry(cid.clone())
            .or_insert_with(|| PinInfo::untracked(cid.clone(), self.peer.clone()));
        info.status = status;
        info.error = error;
        info.timestamp = Utc::now();

        let info = info.clone();
        // No subscribers is fine.
        let _ = self.events.send(info.clone());
        info
    }
}

impl PinInfoStore {
    /// Creates an empty store for the given local peer.
    pub fn new(peer: PeerId, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            peer,
            pins: Mutex::new(Pins::default()),
            events,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Locks the store for a compound operation.
    pub fn lock(&self) -> PinsGuard<'_> {
        PinsGuard {
            pins: self.pins.lock().unwrap_or_else(PoisonError::into_inner),
            peer: &self.peer,
            events: &self.events,
        }
    }

    /// Info for `cid`; unknown CIDs are reported as `Unpinned`.
    pub fn get(&self, cid: &Cid) -> PinInfo {
        self.lock()
            .get(cid)
            .cloned()
            .unwrap_or_else(|| PinInfo::untracked(cid.clone(), self.peer.clone()))
    }

    pub fn status(&self, cid: &Cid) -> TrackerStatus {
        self.lock().status(cid)
    }

    /// Snapshot of every entry, ordered by CID.
    pub fn snapshot(&self) -> Vec<PinInfo> {
        let mut all: Vec<PinInfo> = self.lock().pins.entries.values().cloned().collect();
        all.sort_by(|a, b| a.cid.cmp(&b.cid));
        all
    }

    /// Snapshot of the entries whose status matches `filter`, ordered by CID.
    pub fn filter(&self, filter: impl Fn(TrackerStatus) -> bool) -> Vec<PinInfo> {
        let mut matching: Vec<PinInfo> = self
            .lock()
            .pins
            .entries
            .values()
            .filter(|info| filter(info.status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.cid.cmp(&b.cid));
        matching
    }

    pub fn len(&self) -> usize {
        self.lock().pins.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receives every status change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PinInfo> {
        self.events.subscribe()
    }
}
