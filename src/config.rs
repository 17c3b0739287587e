//! Broker configuration.
//!
//! Read once from a TOML file at startup. An absent or malformed file is
//! not fatal: the broker falls back to defaults (which include the
//! allow-all filter policy) with a logged warning.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::RetryPolicy;
use crate::protocol::DEFAULT_SOCKET_PATH;
use crate::server::DEFAULT_MAX_CONNECTIONS;

/// Name of the managed driver kind when the config does not set one.
pub const DEFAULT_MANAGED_DRIVER: &str = "usb_generic";

/// Broker configuration as loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Path of the listening Unix socket.
    pub socket_path: PathBuf,
    /// Administrator filter rules; absent means allow-all.
    pub filter_rules: Option<String>,
    /// Driver kind this broker binds and unbinds.
    pub managed_driver: String,
    /// Cap on simultaneous client connections.
    pub max_connections: usize,
    /// Retry budget for pending installations.
    pub retry: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            filter_rules: None,
            managed_driver: DEFAULT_MANAGED_DRIVER.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            retry: RetryConfig::default(),
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        #[allow(clippy::cast_possible_truncation)]
        let interval_ms = policy.interval.as_millis() as u64;
        Self {
            attempts: policy.attempts,
            interval_ms,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            interval: Duration::from_millis(config.interval_ms),
        }
    }
}

/// Errors raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Configuration loader that searches multiple locations.
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths in order of priority.
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Creates a loader with the default search paths: the system config
    /// directory first, then the user config directory.
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("/etc/usb-broker/config.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("usb-broker").join("config.toml"));
        }
        Self { search_paths }
    }

    /// Creates a loader pinned to one specific file.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            search_paths: vec![path],
        }
    }

    /// Loads configuration from the first file that exists, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or
    /// parsed. Callers running as the broker treat that as a warning and
    /// fall back to [`BrokerConfig::default`].
    pub fn load(&self) -> Result<BrokerConfig, ConfigError> {
        for path in &self.search_paths {
            if path.exists() {
                tracing::debug!(path = %path.display(), "Loading config file");
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                return toml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                });
            }
        }
        tracing::debug!("No config file found, using defaults");
        Ok(BrokerConfig::default())
    }

    /// Loads like [`ConfigLoader::load`] but never fails: a bad file is
    /// logged and replaced by defaults.
    #[must_use]
    pub fn load_or_default(&self) -> BrokerConfig {
        match self.load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring broken configuration, using defaults");
                BrokerConfig::default()
            }
        }
    }

    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
