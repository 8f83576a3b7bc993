//! Central configuration
//!
//! Default timeouts per operation family and the broadcast channel capacity, read
//! from a TOML file. Every field is optional in the file.
//!
//! ```toml
//! event_capacity = 128
//! connect_timeout_ms = 15000
//! discovery_timeout_ms = 10000
//! io_timeout_ms = 0 # 0 waits for the platform forever
//! ```

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "BLE_CENTRAL_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("toml error: {0}")]
    TomlError(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Buffered events per broadcast channel before slow subscribers lag.
    pub event_capacity: usize,
    /// Default for connect and disconnect. `0` waits forever.
    pub connect_timeout_ms: u64,
    /// Default for service and characteristic discovery.
    pub discovery_timeout_ms: u64,
    /// Default for reads, writes and notify changes.
    pub io_timeout_ms: u64,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            event_capacity: 64,
            connect_timeout_ms: 10_000,
            discovery_timeout_ms: 10_000,
            io_timeout_ms: 5_000,
        }
    }
}

impl CentralConfig {
    /// Load from the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("loading central config from {}", path.display());
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                error!("failed to read config file: {}", e);
                return Err(ConfigError::IoError(e));
            }
        };
        let config: CentralConfig = match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to parse config file: {}", e);
                return Err(ConfigError::TomlError(e));
            }
        };
        debug!("central config: {:?}", config);
        Ok(config)
    }

    /// Load from the file named by [`CONFIG_ENV`], or fall back to defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(path),
            Err(_) => {
                debug!("{} not set, using default central config", CONFIG_ENV);
                Ok(Self::default())
            }
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Option<Duration> {
        millis(self.discovery_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        millis(self.io_timeout_ms)
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// How long a request may stay pending before it resolves with a timeout error.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Use the configured default for the operation family.
    #[default]
    Default,
    /// Never time out; only the platform or closing the central resolves the request.
    Never,
    After(Duration),
}

impl Timeout {
    pub(crate) fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Timeout::Default => default,
            Timeout::Never => None,
            Timeout::After(duration) => Some(duration),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Timeout::After(duration)
    }
}
