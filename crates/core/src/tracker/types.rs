//! Types for the pin tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::connector::ConnectorError;

use super::queue::AdmissionError;

/// Content identifier. The key under which pin state is tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cid(String);

impl Cid {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidIdentifier> {
        let value = value.into();
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(InvalidIdentifier(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Cid {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Cid {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Cid> for String {
    fn from(cid: Cid) -> Self {
        cid.0
    }
}

/// Identifier of a cluster peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidIdentifier> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(InvalidIdentifier(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = InvalidIdentifier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> Self {
        peer.0
    }
}

/// Rejected CID or peer identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier: {0:?}")]
pub struct InvalidIdentifier(pub String);

/// A pin intent as assigned to this peer by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    pub cid: Cid,
    /// Peers that should hold the content. Empty means everywhere.
    #[serde(default)]
    pub allocations: Vec<PeerId>,
    /// -1 means the content is pinned on every peer.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

fn default_replication_factor() -> i32 {
    -1
}

impl Pin {
    /// A pin meant for every peer.
    pub fn everywhere(cid: Cid) -> Self {
        Self {
            cid,
            allocations: Vec::new(),
            replication_factor: -1,
        }
    }

    /// A pin allocated to the given peers.
    pub fn allocated(cid: Cid, allocations: Vec<PeerId>) -> Self {
        let replication_factor = i32::try_from(allocations.len()).unwrap_or(i32::MAX);
        Self {
            cid,
            allocations,
            replication_factor,
        }
    }

    /// Whether another peer, and not `local`, is responsible for this pin.
    pub fn is_remote_for(&self, local: &PeerId) -> bool {
        if self.replication_factor == -1 || self.allocations.is_empty() {
            return false;
        }
        !self.allocations.contains(local)
    }
}

impl From<Cid> for Pin {
    fn from(cid: Cid) -> Self {
        Self::everywhere(cid)
    }
}

/// The two daemon operations the tracker mediates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinOperation {
    Pin,
    Unpin,
}

impl PinOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinOperation::Pin => "pin",
            PinOperation::Unpin => "unpin",
        }
    }

    pub fn queued_status(&self) -> TrackerStatus {
        match self {
            PinOperation::Pin => TrackerStatus::PinQueued,
            PinOperation::Unpin => TrackerStatus::UnpinQueued,
        }
    }

    pub fn in_progress_status(&self) -> TrackerStatus {
        match self {
            PinOperation::Pin => TrackerStatus::Pinning,
            PinOperation::Unpin => TrackerStatus::Unpinning,
        }
    }

    pub fn done_status(&self) -> TrackerStatus {
        match self {
            PinOperation::Pin => TrackerStatus::Pinned,
            PinOperation::Unpin => TrackerStatus::Unpinned,
        }
    }

    pub fn error_status(&self) -> TrackerStatus {
        match self {
            PinOperation::Pin => TrackerStatus::PinError,
            PinOperation::Unpin => TrackerStatus::UnpinError,
        }
    }

    pub fn opposite(&self) -> PinOperation {
        match self {
            PinOperation::Pin => PinOperation::Unpin,
            PinOperation::Unpin => PinOperation::Pin,
        }
    }
}

impl fmt::Display for PinOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local state of a CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    /// Not pinned locally. Also the implicit state of unknown CIDs.
    Unpinned,
    PinQueued,
    Pinning,
    Pinned,
    PinError,
    UnpinQueued,
    Unpinning,
    UnpinError,
    /// Allocated to other peers only.
    Remote,
}

impl TrackerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerStatus::Unpinned => "unpinned",
            TrackerStatus::PinQueued => "pin_queued",
            TrackerStatus::Pinning => "pinning",
            TrackerStatus::Pinned => "pinned",
            TrackerStatus::PinError => "pin_error",
            TrackerStatus::UnpinQueued => "unpin_queued",
            TrackerStatus::Unpinning => "unpinning",
            TrackerStatus::UnpinError => "unpin_error",
            TrackerStatus::Remote => "remote",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TrackerStatus::PinError | TrackerStatus::UnpinError)
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, TrackerStatus::PinQueued | TrackerStatus::UnpinQueued)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, TrackerStatus::Pinning | TrackerStatus::Unpinning)
    }

    /// Operation a worker would have to run to leave an error state.
    pub fn recovery_operation(&self) -> Option<PinOperation> {
        match self {
            TrackerStatus::PinError => Some(PinOperation::Pin),
            TrackerStatus::UnpinError => Some(PinOperation::Unpin),
            _ => None,
        }
    }
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracking state of one CID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinInfo {
    pub cid: Cid,
    pub status: TrackerStatus,
    /// Time of the last status change.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Peer holding this state.
    pub peer: PeerId,
}

impl PinInfo {
    pub fn new(cid: Cid, status: TrackerStatus, peer: PeerId) -> Self {
        Self {
            cid,
            status,
            timestamp: Utc::now(),
            error: None,
            peer,
        }
    }

    /// Info reported for a CID the tracker has never seen.
    pub fn untracked(cid: Cid, peer: PeerId) -> Self {
        Self::new(cid, TrackerStatus::Unpinned, peer)
    }
}

/// Errors returned by tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The intent could not be queued.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The daemon call failed.
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// The tracker no longer accepts work.
    #[error("pin tracker is shutting down")]
    ShuttingDown,

    /// The operation is not allowed in the current state.
    #[error("cannot {operation} {cid}: current status is {status}")]
    InvalidState {
        cid: Cid,
        status: TrackerStatus,
        operation: String,
    },
}

/// Counters of one worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Pool name ("pin" or "unpin").
    pub name: String,
    /// Number of workers.
    pub workers: usize,
    /// Connector calls currently running.
    pub active: usize,
    /// Entries waiting in the admission queue.
    pub queued: usize,
    /// Admission queue capacity.
    pub capacity: usize,
    pub total_processed: u64,
    pub total_failed: u64,
}

/// Snapshot of the tracker's runtime state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub running: bool,
    pub tracked: usize,
    pub pin_pool: PoolStatus,
    pub unpin_pool: PoolStatus,
}
