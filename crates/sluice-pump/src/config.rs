//! Pump configuration: TOML file merged with CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::PumpError;

/// Configuration for one pump process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PumpConfig {
    /// gRPC listen address, `host:port`.
    pub listen_addr: String,
    /// Root directory for all cluster binlogs.
    pub data_dir: PathBuf,
    /// Stable node identifier used in the registry.
    pub node_id: String,
    /// Consensus KV endpoints; empty means standalone (in-process registry).
    pub kv_endpoints: Vec<String>,
    /// Delete segments older than this many days (0 disables GC).
    pub gc_days: u64,
    /// Rotation threshold for binlog segments, in bytes.
    pub segment_size: i64,
    /// Seconds between fake-binlog heartbeat checks.
    pub heartbeat_interval_secs: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8250".to_string(),
            data_dir: PathBuf::from("data.pump"),
            node_id: String::new(),
            kv_endpoints: Vec::new(),
            gc_days: 7,
            segment_size: sluice_storage::DEFAULT_SEGMENT_SIZE,
            heartbeat_interval_secs: 3,
        }
    }
}

impl PumpConfig {
    /// Loads a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, PumpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| PumpError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| PumpError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Rejects configurations that cannot possibly start.
    pub fn validate(&self) -> Result<(), PumpError> {
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|source| PumpError::ListenAddr {
                addr: self.listen_addr.clone(),
                source,
            })?;
        Ok(())
    }

    /// GC retention as a duration.
    #[must_use]
    pub fn gc_retention(&self) -> Duration {
        Duration::from_secs(self.gc_days * 24 * 60 * 60)
    }

    /// Heartbeat check interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}
