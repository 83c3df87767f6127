pub mod config;
pub mod connector;
pub mod metrics;
pub mod testing;
pub mod tracker;

pub use config::{
    load_config, load_config_from_str, validate_config, ConfigError, TrackerConfig,
};
pub use connector::{ConnectorError, DaemonConnector};
pub use tracker::{
    AdmissionError, Cid, PeerId, Pin, PinInfo, PinOperation, PinTracker, TrackerError,
    TrackerStats, TrackerStatus,
};
