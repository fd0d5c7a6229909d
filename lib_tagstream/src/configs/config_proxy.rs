//! # Proxy Configuration
//!
//! `ProxyConfig` is the settled configuration a `TagProxy` runs with. It reads
//! from camelCase JSON, where every field is optional and falls back to its
//! default:
//!
//! ```json
//! {
//!   "brokerUrl": "redis://127.0.0.1/",
//!   "supervisionTopic": "tagstream.client.supervision",
//!   "reconnectIntervalMs": 5000,
//!   "autoStartup": false,
//!   "requestTimeoutMs": 10000,
//!   "healthCheckIntervalMs": 5000
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default pause between two connection attempts.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;
/// Default request/reply timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10000;
/// Default broker liveness check period.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 5000;
/// Default supervision topic.
pub const DEFAULT_SUPERVISION_TOPIC: &str = "tagstream.client.supervision";
/// Default broker location.
pub const DEFAULT_BROKER_URL: &str = "redis://127.0.0.1/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    pub broker_url: String,
    pub supervision_topic: String,
    pub reconnect_interval_ms: u64,
    pub auto_startup: bool,
    pub request_timeout_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            supervision_topic: DEFAULT_SUPERVISION_TOPIC.to_string(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            auto_startup: false,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
        }
    }
}

impl ProxyConfig {
    /// Loads and validates a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: ProxyConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervision_topic.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "supervisionTopic", reason: "must not be empty".to_string() });
        }
        if self.broker_url.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "brokerUrl", reason: "must not be empty".to_string() });
        }
        // Zero intervals would turn the reconnect and health loops into busy loops.
        for (field, value) in [
            ("reconnectIntervalMs", self.reconnect_interval_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
            ("healthCheckIntervalMs", self.health_check_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid { field, reason: "must be greater than zero".to_string() });
            }
        }
        Ok(())
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}
