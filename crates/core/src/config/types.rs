use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ConfigError;

/// Default capacity of each admission queue.
pub const DEFAULT_MAX_PIN_QUEUE_SIZE: usize = 1_000_000;

/// Default number of pin requests sent to the daemon in parallel.
pub const DEFAULT_CONCURRENT_PINS: usize = 10;

/// Default bound on a single daemon call, in seconds.
pub const DEFAULT_CONNECTOR_TIMEOUT_SECS: u64 = 3600;

/// Pin tracker configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// Capacity of the pin queue and of the unpin queue. Intents arriving
    /// while a queue is full are rejected and marked with an error.
    #[serde(
        default = "default_max_pin_queue_size",
        skip_serializing_if = "is_default_queue_size"
    )]
    pub max_pin_queue_size: usize,

    /// How many pin requests can be sent to the daemon in parallel.
    /// Unpin requests are always processed one by one.
    #[serde(default = "default_concurrent_pins")]
    pub concurrent_pins: usize,

    /// Upper bound for a single pin or unpin call.
    #[serde(default = "default_connector_timeout")]
    pub connector_timeout_secs: u64,
}

fn default_max_pin_queue_size() -> usize {
    DEFAULT_MAX_PIN_QUEUE_SIZE
}

fn default_concurrent_pins() -> usize {
    DEFAULT_CONCURRENT_PINS
}

fn default_connector_timeout() -> u64 {
    DEFAULT_CONNECTOR_TIMEOUT_SECS
}

fn is_default_queue_size(size: &usize) -> bool {
    *size == DEFAULT_MAX_PIN_QUEUE_SIZE
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_pin_queue_size: default_max_pin_queue_size(),
            concurrent_pins: default_concurrent_pins(),
            connector_timeout_secs: default_connector_timeout(),
        }
    }
}

impl TrackerConfig {
    /// Sets the queue capacity.
    pub fn with_max_pin_queue_size(mut self, size: usize) -> Self {
        self.max_pin_queue_size = size;
        self
    }

    /// Sets the pin worker count.
    pub fn with_concurrent_pins(mut self, pins: usize) -> Self {
        self.concurrent_pins = pins;
        self
    }

    /// Sets the connector call timeout.
    pub fn with_connector_timeout_secs(mut self, secs: u64) -> Self {
        self.connector_timeout_secs = secs;
        self
    }

    pub fn connector_timeout(&self) -> Duration {
        Duration::from_secs(self.connector_timeout_secs)
    }

    /// Human-friendly JSON form. `max_pin_queue_size` is left out while it
    /// holds the default value.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
