//! The drainer: read-side replay service of the sluice pipeline.
//!
//! One puller per registered pump streams binlog entities and pairs
//! prewrites with their commits; a k-way merger fans them in by commit
//! timestamp; the schema tracker resolves row bytes against historical
//! table metadata; the translator lowers mutations into the loader's
//! normalized row model; a pluggable syncer applies them downstream; and
//! the checkpoint subsystem records how far the downstream has durably
//! advanced so a restart never loses data.

#![warn(clippy::all)]

pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod merge;
pub mod pump;
pub mod schema;
pub mod server;
pub mod sync;
pub mod translator;

pub use config::{DestinationType, DrainerConfig};
pub use merge::{MergeSource, Mergeable, Merger};
pub use pump::{BinlogItem, PumpPuller};
pub use schema::{SchemaError, SchemaTracker};
pub use server::Drainer;

/// Errors from the drainer.
#[derive(Debug, thiserror::Error)]
pub enum DrainerError {
    /// Registry/membership failure.
    #[error("registry error: {0}")]
    Registry(#[from] sluice_registry::RegistryError),

    /// Schema tracking failure; indicates a gap in the job log and is
    /// fatal to the pipeline.
    #[error("schema error: {0}")]
    Schema(#[from] schema::SchemaError),

    /// Loader failure.
    #[error("loader error: {0}")]
    Loader(#[from] sluice_loader::LoaderError),

    /// Checkpoint persistence failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint::CheckpointError),

    /// Local sink storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] sluice_storage::StorageError),

    /// A binlog payload failed to decode.
    #[error("binlog decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A row referenced a column id missing from the schema snapshot.
    #[error("unknown column {column_id} in table {table}")]
    UnknownColumn {
        /// Qualified table name.
        table: String,
        /// The unresolvable column id.
        column_id: i64,
    },

    /// A source emitted a commit timestamp that does not advance.
    #[error("non-monotone commit ts {ts} from {source_name} (last {last})")]
    NonMonotone {
        /// Offending source.
        source_name: String,
        /// The regressing timestamp.
        ts: i64,
        /// Highest timestamp seen before it.
        last: i64,
    },

    /// A pipeline channel closed out from under its producer.
    #[error("pipeline channel closed")]
    ChannelClosed,

    /// Config file could not be read or parsed, or failed validation.
    #[error("config error: {0}")]
    Config(String),

    /// Message sink failure.
    #[error("message sink error: {0}")]
    Message(String),

    /// A task panicked or was aborted.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
