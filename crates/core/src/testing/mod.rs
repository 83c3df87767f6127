//! Testing utilities and mock implementations.
//!
//! This module provides a mock daemon connector and fixtures, allowing the
//! tracker to be exercised without a running storage daemon.
//!
//! # Example
//!
//! ```rust,ignore
//! use pintracker_core::testing::{fixtures, MockConnector};
//!
//! let connector = MockConnector::new();
//! let tracker = PinTracker::new(config, fixtures::local_peer(), Arc::new(connector.clone()))?;
//! ```

mod mock_connector;

pub use mock_connector::{MockConnector, RecordedCall};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::tracker::{Cid, PeerId, Pin};

    /// The peer id tests run the tracker as.
    pub fn local_peer() -> PeerId {
        PeerId::new("12D3KooWLocalPeer").expect("valid peer id")
    }

    /// Some other cluster peer.
    pub fn remote_peer() -> PeerId {
        PeerId::new("12D3KooWRemotePeer").expect("valid peer id")
    }

    /// A distinct, valid CID for index `n`.
    pub fn cid(n: usize) -> Cid {
        Cid::new(format!("QmTestContent{:04}", n)).expect("valid cid")
    }

    /// A pin for every peer.
    pub fn pin(n: usize) -> Pin {
        Pin::everywhere(cid(n))
    }

    /// A pin allocated to another peer only.
    pub fn remote_pin(n: usize) -> Pin {
        Pin::allocated(cid(n), vec![remote_peer()])
    }
}
