//! Durable replication progress.
//!
//! The record pairs the highest downstream-acknowledged commit ts with a
//! status flag: `Normal` means a clean shutdown, `Running` means the
//! process died mid-flight and the restart must run safe mode for a
//! window. Per-pump file positions ride along; they track the *applied*
//! frontier, never the read frontier, so a restart that resumes from
//! them re-reads exactly the records whose transactions were not yet
//! acknowledged, however far ahead the pullers had read.

mod file;
mod table;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sluice_proto::Pos;

pub use file::FileCheckpoint;
pub use table::SqliteCheckpoint;

/// How the previous run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    /// Clean shutdown; resume without safe mode.
    Normal,
    /// Crash or kill; resume with safe mode for a window.
    Running,
}

/// A serializable binlog position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosRecord {
    pub suffix: u64,
    pub offset: i64,
}

impl From<Pos> for PosRecord {
    fn from(pos: Pos) -> Self {
        Self {
            suffix: pos.suffix,
            offset: pos.offset,
        }
    }
}

impl From<PosRecord> for Pos {
    fn from(pos: PosRecord) -> Self {
        Self {
            suffix: pos.suffix,
            offset: pos.offset,
        }
    }
}

/// The durable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Highest commit ts acknowledged by the downstream.
    pub commit_ts: i64,
    pub status: CheckpointStatus,
    /// Optional upstream/downstream clock pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ts_map: BTreeMap<String, i64>,
    /// Per-pump resume positions: the applied frontier of each source.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub positions: BTreeMap<String, PosRecord>,
}

impl CheckpointRecord {
    /// A record with just the ts/status pair.
    #[must_use]
    pub fn new(commit_ts: i64, status: CheckpointStatus) -> Self {
        Self {
            commit_ts,
            status,
            ts_map: BTreeMap::new(),
            positions: BTreeMap::new(),
        }
    }
}

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// No record stored yet; the caller falls back to the configured
    /// initial commit ts.
    #[error("no checkpoint record")]
    NotFound,

    /// File backend I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record (de)serialization failure.
    #[error("encode error: {0}")]
    Encode(String),

    /// Table backend failure.
    #[error("checkpoint table error: {0}")]
    Sql(String),
}

/// Durable `(commit_ts, status)` storage, serialized behind each
/// implementation's own lock.
#[async_trait]
pub trait CheckPoint: Send + Sync {
    /// The last saved record, or [`CheckpointError::NotFound`].
    async fn load(&self) -> Result<CheckpointRecord, CheckpointError>;

    /// Persist a record synchronously.
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    /// True once the minimum save interval has elapsed; the background
    /// ticker only writes when this gate opens.
    fn check(&self) -> bool;
}
