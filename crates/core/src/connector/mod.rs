//! Storage daemon connector abstraction.
//!
//! The pin tracker never talks to the daemon directly. The surrounding system
//! supplies a `DaemonConnector` that knows how to reach it (HTTP API, IPC, an
//! embedded node, ...).

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

use crate::tracker::Cid;

/// Errors reported by a daemon connector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// The daemon refused or failed the request.
    #[error("{0}")]
    Daemon(String),

    /// The daemon could not be reached.
    #[error("daemon unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish within the configured bound.
    #[error("daemon call timed out after {0:?}")]
    Timeout(Duration),
}

/// Pin/unpin capability of the local storage daemon.
#[async_trait]
pub trait DaemonConnector: Send + Sync {
    /// Name of the connector, for logs.
    fn name(&self) -> &str;

    /// Pin `cid` on the daemon. Returns once the content is pinned.
    async fn pin(&self, cid: &Cid) -> Result<(), ConnectorError>;

    /// Unpin `cid` on the daemon.
    async fn unpin(&self, cid: &Cid) -> Result<(), ConnectorError>;

    /// Every CID the daemon currently holds pinned.
    async fn pin_ls(&self) -> Result<HashSet<Cid>, ConnectorError>;

    /// Whether the daemon holds `cid` pinned.
    async fn is_pinned(&self, cid: &Cid) -> Result<bool, ConnectorError> {
        Ok(self.pin_ls().await?.contains(cid))
    }
}
