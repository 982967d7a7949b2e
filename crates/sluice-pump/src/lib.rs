//! The pump: write-side service of the sluice pipeline.
//!
//! SQL nodes append prewrite/commit binlogs over gRPC; drainers stream them
//! back out by ascending file position. A background heartbeat appends
//! rollback-typed records while the workload is idle so that downstream
//! merge windows keep advancing.

#![warn(clippy::all)]

pub mod config;
pub mod oracle;
pub mod server;

pub use config::PumpConfig;
pub use oracle::{ClockOracle, TimestampOracle};
pub use server::Server;

use std::path::PathBuf;

/// Errors from the pump service.
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    /// Binlog storage failure; fatal to the writer.
    #[error("storage error: {0}")]
    Storage(#[from] sluice_storage::StorageError),

    /// Membership registration failure.
    #[error("registry error: {0}")]
    Registry(#[from] sluice_registry::RegistryError),

    /// The timestamp oracle could not produce a timestamp.
    #[error("timestamp oracle error: {0}")]
    Oracle(String),

    /// gRPC transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// The configured listen address does not parse.
    #[error("invalid listen address {addr}: {source}")]
    ListenAddr {
        /// The offending address.
        addr: String,
        /// Parse failure.
        #[source]
        source: std::net::AddrParseError,
    },

    /// Config file could not be read or parsed.
    #[error("config error in {path}: {message}")]
    Config {
        /// The offending file.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A background task panicked or was aborted.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
