//! Drainer configuration: TOML file merged with CLI flags.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::DrainerError;

/// Where replayed transactions go.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DestinationType {
    /// Segmented relay log plus a timestamp index.
    File {
        /// Sink directory.
        dir: PathBuf,
    },
    /// SQL database reached through the loader (SQLite file in the
    /// standalone build; other dialects plug in behind the executor seam).
    Sqlite {
        /// Database file.
        path: PathBuf,
    },
    /// Ordered Kafka topic (requires the `kafka` feature).
    Kafka {
        /// Comma-separated broker list.
        brokers: String,
        /// Topic name.
        topic: String,
    },
    /// Log-and-acknowledge debug sink.
    Print,
}

/// Configuration for one drainer process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DrainerConfig {
    /// Advertised address of this drainer, `host:port`.
    pub listen_addr: String,
    /// Directory for the checkpoint and any file-based sink state.
    pub data_dir: PathBuf,
    /// Cluster whose binlog is replayed.
    pub cluster_id: u64,
    /// Consensus KV endpoints; empty means standalone.
    pub kv_endpoints: Vec<String>,
    /// Replay starts here when no checkpoint exists yet.
    pub initial_commit_ts: i64,
    /// Parallel loader workers.
    pub worker_count: usize,
    /// Transactions per downstream commit.
    pub batch_size: usize,
    /// Force single-channel dispatch.
    pub disable_dispatch: bool,
    /// Keep safe mode on permanently.
    pub safe_mode: bool,
    /// Schemas whose mutations are dropped.
    pub ignore_schemas: Vec<String>,
    /// The downstream target.
    pub dest: DestinationType,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8249".to_string(),
            data_dir: PathBuf::from("data.drainer"),
            cluster_id: 0,
            kv_endpoints: Vec::new(),
            initial_commit_ts: 0,
            worker_count: 16,
            batch_size: 20,
            disable_dispatch: false,
            safe_mode: false,
            ignore_schemas: vec![
                "information_schema".to_string(),
                "performance_schema".to_string(),
                "mysql".to_string(),
            ],
            dest: DestinationType::Print,
        }
    }
}

impl DrainerConfig {
    /// Loads a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, DrainerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DrainerError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| DrainerError::Config(format!("{}: {e}", path.display())))
    }

    /// Rejects configurations that cannot possibly run.
    pub fn validate(&self) -> Result<(), DrainerError> {
        self.listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| DrainerError::Config(format!("listen_addr {}: {e}", self.listen_addr)))?;
        if self.worker_count == 0 {
            return Err(DrainerError::Config("worker_count must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(DrainerError::Config("batch_size must be positive".into()));
        }
        #[cfg(not(feature = "kafka"))]
        if matches!(self.dest, DestinationType::Kafka { .. }) {
            return Err(DrainerError::Config(
                "kafka destination requires the `kafka` feature".into(),
            ));
        }
        Ok(())
    }

    /// The checkpoint file path for file-backed progress.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir.join("savepoint")
    }
}
