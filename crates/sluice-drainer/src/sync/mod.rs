//! Pluggable downstream syncers.
//!
//! The supervisor holds exactly one [`Syncer`] behind the trait: the
//! parallel loader for SQL targets, single-writer file and message sinks,
//! and the print/memory sinks for debugging and tests. Every variant
//! acknowledges a transaction on its successes channel only after the
//! write is durable downstream.

mod file;
#[cfg(feature = "kafka")]
mod kafka;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use sluice_loader::{Executor, Loader, LoaderConfig, Txn};

use crate::DrainerError;

pub use file::FileSyncer;
#[cfg(feature = "kafka")]
pub use kafka::KafkaSyncer;

/// Capacity of the success channels of the serial sinks.
const SUCCESS_CHAN_SIZE: usize = 512;

/// One downstream target.
#[async_trait]
pub trait Syncer: Send {
    /// Hand one transaction to the sink, in emit order. Backpressure is
    /// the bounded channel or write inside.
    async fn sync(&mut self, txn: Txn) -> Result<(), DrainerError>;

    /// Takes the successes receiver; callable once.
    fn take_successes(&mut self) -> Option<mpsc::Receiver<Txn>>;

    /// Switches idempotent apply on or off. Sinks that are naturally
    /// idempotent ignore it.
    fn set_safe_mode(&self, _on: bool) {}

    /// Enables idempotent apply for a window after an abnormal restart.
    /// Sinks that are naturally idempotent ignore it.
    fn enable_safe_mode_for(&self, _window: Duration) {}

    /// Flush, release resources, and surface the first failure.
    async fn close(self: Box<Self>) -> Result<(), DrainerError>;
}

/// SQL syncer: translation output goes through the parallel loader.
pub struct LoaderSyncer {
    input: mpsc::Sender<Txn>,
    loader: Option<Loader>,
}

impl LoaderSyncer {
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, cfg: LoaderConfig) -> Self {
        let loader = Loader::spawn(executor, cfg);
        Self {
            input: loader.input(),
            loader: Some(loader),
        }
    }
}

#[async_trait]
impl Syncer for LoaderSyncer {
    async fn sync(&mut self, txn: Txn) -> Result<(), DrainerError> {
        self.input
            .send(txn)
            .await
            .map_err(|_| DrainerError::ChannelClosed)
    }

    fn take_successes(&mut self) -> Option<mpsc::Receiver<Txn>> {
        self.loader.as_mut().and_then(Loader::take_successes)
    }

    fn set_safe_mode(&self, on: bool) {
        if let Some(loader) = &self.loader {
            loader.set_safe_mode(on);
        }
    }

    fn enable_safe_mode_for(&self, window: Duration) {
        if let Some(loader) = &self.loader {
            loader.enable_safe_mode_for(window);
        }
    }

    async fn close(self: Box<Self>) -> Result<(), DrainerError> {
        let Self { input, loader } = *self;
        drop(input);
        if let Some(loader) = loader {
            loader.close().await?;
        }
        Ok(())
    }
}

/// Test sink: records every transaction in memory.
pub struct MemorySyncer {
    applied: Arc<Mutex<Vec<Txn>>>,
    success_tx: mpsc::Sender<Txn>,
    success_rx: Option<mpsc::Receiver<Txn>>,
}

impl MemorySyncer {
    #[must_use]
    pub fn new() -> Self {
        let (success_tx, success_rx) = mpsc::channel(SUCCESS_CHAN_SIZE);
        Self {
            applied: Arc::new(Mutex::new(Vec::new())),
            success_tx,
            success_rx: Some(success_rx),
        }
    }

    /// Shared view of everything applied, for assertions.
    #[must_use]
    pub fn applied(&self) -> Arc<Mutex<Vec<Txn>>> {
        Arc::clone(&self.applied)
    }
}

impl Default for MemorySyncer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Syncer for MemorySyncer {
    async fn sync(&mut self, txn: Txn) -> Result<(), DrainerError> {
        self.applied.lock().push(txn.clone());
        self.success_tx
            .send(txn)
            .await
            .map_err(|_| DrainerError::ChannelClosed)
    }

    fn take_successes(&mut self) -> Option<mpsc::Receiver<Txn>> {
        self.success_rx.take()
    }

    async fn close(self: Box<Self>) -> Result<(), DrainerError> {
        Ok(())
    }
}

/// Debug sink: logs each transaction and acknowledges immediately.
pub struct PrintSyncer {
    success_tx: mpsc::Sender<Txn>,
    success_rx: Option<mpsc::Receiver<Txn>>,
}

impl PrintSyncer {
    #[must_use]
    pub fn new() -> Self {
        let (success_tx, success_rx) = mpsc::channel(SUCCESS_CHAN_SIZE);
        Self {
            success_tx,
            success_rx: Some(success_rx),
        }
    }
}

impl Default for PrintSyncer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Syncer for PrintSyncer {
    async fn sync(&mut self, txn: Txn) -> Result<(), DrainerError> {
        match &txn.ddl {
            Some(ddl) => {
                tracing::info!(commit_ts = txn.commit_ts, sql = %ddl.sql, "ddl");
            }
            None => {
                tracing::info!(commit_ts = txn.commit_ts, dmls = txn.dmls.len(), "dml txn");
            }
        }
        self.success_tx
            .send(txn)
            .await
            .map_err(|_| DrainerError::ChannelClosed)
    }

    fn take_successes(&mut self) -> Option<mpsc::Receiver<Txn>> {
        self.success_rx.take()
    }

    async fn close(self: Box<Self>) -> Result<(), DrainerError> {
        Ok(())
    }
}
