//! Single-writer file sink.
//!
//! Appends JSON-encoded transactions to a segmented log with the same
//! framing the pump uses, plus a `(commit_ts → position)` index flushed
//! on an interval so downstream readers can seek by timestamp.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use sluice_loader::Txn;
use sluice_storage::{Binlogger, Options};

use super::Syncer;
use crate::checkpoint::PosRecord;
use crate::DrainerError;

/// How often the timestamp index is rewritten.
const INDEX_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// File sink writing framed records under `dir/log`, with the index at
/// `dir/index.toml`.
pub struct FileSyncer {
    binlogger: Binlogger,
    index_path: PathBuf,
    index: BTreeMap<String, PosRecord>,
    index_dirty: bool,
    last_index_flush: Instant,
    success_tx: mpsc::Sender<Txn>,
    success_rx: Option<mpsc::Receiver<Txn>>,
}

impl FileSyncer {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, DrainerError> {
        let dir = dir.into();
        let binlogger = Binlogger::open_or_create(dir.join("log"), Options::default())?;
        let (success_tx, success_rx) = mpsc::channel(super::SUCCESS_CHAN_SIZE);
        Ok(Self {
            binlogger,
            index_path: dir.join("index.toml"),
            index: BTreeMap::new(),
            index_dirty: false,
            last_index_flush: Instant::now(),
            success_tx,
            success_rx: Some(success_rx),
        })
    }

    fn flush_index(&mut self) -> Result<(), DrainerError> {
        if !self.index_dirty {
            return Ok(());
        }
        let encoded = toml::to_string_pretty(&self.index)
            .map_err(|e| DrainerError::Config(e.to_string()))?;
        let tmp = self.index_path.with_extension("tmp");
        std::fs::write(&tmp, encoded).map_err(sluice_storage::StorageError::Io)?;
        std::fs::rename(&tmp, &self.index_path).map_err(sluice_storage::StorageError::Io)?;
        self.index_dirty = false;
        self.last_index_flush = Instant::now();
        Ok(())
    }
}

#[async_trait]
impl Syncer for FileSyncer {
    async fn sync(&mut self, txn: Txn) -> Result<(), DrainerError> {
        let payload =
            serde_json::to_vec(&txn).map_err(|e| DrainerError::Config(e.to_string()))?;
        let pos = self.binlogger.write_tail(&payload)?;
        self.index
            .insert(txn.commit_ts.to_string(), PosRecord::from(pos));
        self.index_dirty = true;
        if self.last_index_flush.elapsed() >= INDEX_FLUSH_INTERVAL {
            self.flush_index()?;
        }
        self.success_tx
            .send(txn)
            .await
            .map_err(|_| DrainerError::ChannelClosed)
    }

    fn take_successes(&mut self) -> Option<mpsc::Receiver<Txn>> {
        self.success_rx.take()
    }

    async fn close(mut self: Box<Self>) -> Result<(), DrainerError> {
        self.flush_index()?;
        self.binlogger.close()?;
        Ok(())
    }
}
