use tokio::sync::Semaphore;

use super::{types::TrackerConfig, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Queue capacity is not 0 and fits a bounded channel
/// - Pin concurrency is not 0
/// - Connector timeout is not 0
pub fn validate_config(config: &TrackerConfig) -> Result<(), ConfigError> {
    if config.max_pin_queue_size == 0 {
        return Err(ConfigError::ValidationError(
            "maptracker.max_pin_queue_size too low".to_string(),
        ));
    }

    if config.max_pin_queue_size > Semaphore::MAX_PERMITS {
        return Err(ConfigError::ValidationError(format!(
            "maptracker.max_pin_queue_size too high (max {})",
            Semaphore::MAX_PERMITS
        )));
    }

    if config.concurrent_pins == 0 {
        return Err(ConfigError::ValidationError(
            "maptracker.concurrent_pins is too low".to_string(),
        ));
    }

    if config.connector_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "maptracker.connector_timeout_secs cannot be 0".to_string(),
        ));
    }

    Ok(())
}
