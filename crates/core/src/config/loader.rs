use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use std::path::Path;

use super::{types::TrackerConfig, validate::validate_config, ConfigError};

/// Table holding the tracker section in a cluster configuration file.
pub const CONFIG_KEY: &str = "maptracker";

/// Prefix of environment variables overriding file values,
/// e.g. `CLUSTER_MAPTRACKER_CONCURRENT_PINS=4`.
pub const ENV_PREFIX: &str = "CLUSTER_MAPTRACKER_";

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<TrackerConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: TrackerConfig = Figment::from(Serialized::defaults(TrackerConfig::default()))
        .merge(Figment::from(Toml::file(path)).focus(CONFIG_KEY))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    validate_config(&config)?;
    tracing::debug!(
        max_pin_queue_size = config.max_pin_queue_size,
        concurrent_pins = config.concurrent_pins,
        "Loaded pin tracker configuration from {:?}",
        path
    );

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<TrackerConfig, ConfigError> {
    let config: TrackerConfig = Figment::from(Serialized::defaults(TrackerConfig::default()))
        .merge(Figment::from(Toml::string(toml_str)).focus(CONFIG_KEY))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    validate_config(&config)?;
    Ok(config)
}
