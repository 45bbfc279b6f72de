//! Shipper configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ShipError};
use crate::sink_manager::SinkManagerConfig;

/// How long an idle dispatch worker is kept around.
///
/// Dispatch units are tokio tasks that exit when their delivery finishes, so
/// nothing is reaped on this timer; the value is kept for operators reading
/// the shipper's settings.
pub const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for one inter-cluster shipper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipperConfig {
    /// Ceiling for the standard retry multiplier.
    pub max_retries_multiplier: u32,
    /// Multiplier used after a socket timeout. Defaults to `max_retries_multiplier`.
    pub socket_timeout_multiplier: Option<u32>,
    /// Base sleep between retries, in milliseconds.
    pub sleep_for_retries_ms: u64,
    /// Maximum number of sub-batches shipped in parallel.
    pub max_threads: usize,
    /// Fraction of the peer's region servers used as sinks.
    pub replication_ratio: f64,
    /// Failed deliveries after which a sink is evicted.
    pub bad_sink_threshold: u32,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            max_retries_multiplier: 300,
            socket_timeout_multiplier: None,
            sleep_for_retries_ms: 1000,
            max_threads: 10,
            replication_ratio: 0.1,
            bad_sink_threshold: 3,
        }
    }
}

impl ShipperConfig {
    /// Load a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ShipperConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ShipError::Config {
                msg: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| ShipError::Config {
                msg: format!("{}: {}", path.display(), e),
            })?,
            _ => {
                return Err(ShipError::Config {
                    msg: format!("unsupported config file extension: {:?}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(ShipError::Config {
                msg: "max_threads must be at least 1".to_string(),
            });
        }
        if self.max_retries_multiplier == 0 {
            return Err(ShipError::Config {
                msg: "max_retries_multiplier must be at least 1".to_string(),
            });
        }
        if self.socket_timeout_multiplier == Some(0) {
            return Err(ShipError::Config {
                msg: "socket_timeout_multiplier must be at least 1".to_string(),
            });
        }
        if !(self.replication_ratio > 0.0 && self.replication_ratio <= 1.0) {
            return Err(ShipError::Config {
                msg: format!(
                    "replication_ratio must be in (0, 1], got {}",
                    self.replication_ratio
                ),
            });
        }
        if self.bad_sink_threshold == 0 {
            return Err(ShipError::Config {
                msg: "bad_sink_threshold must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Multiplier applied after a socket timeout.
    pub fn effective_socket_timeout_multiplier(&self) -> u32 {
        self.socket_timeout_multiplier
            .unwrap_or(self.max_retries_multiplier)
    }

    /// Base sleep between retries.
    pub fn sleep_for_retries(&self) -> Duration {
        Duration::from_millis(self.sleep_for_retries_ms)
    }

    /// Sink selection settings derived from this config.
    pub fn sink_manager_config(&self) -> SinkManagerConfig {
        SinkManagerConfig {
            replication_ratio: self.replication_ratio,
            bad_sink_threshold: self.bad_sink_threshold,
        }
    }
}
