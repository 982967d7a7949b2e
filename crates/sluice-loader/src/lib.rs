//! Parallel DML loader.
//!
//! Transactions arrive on a single input channel in commit order. The
//! dispatcher groups them by causality (shared primary- or unique-key
//! values), hashes each group to a worker, and lets independent groups run
//! in parallel; a DDL forces a full barrier. Workers batch DMLs, rewrite
//! them into idempotent forms in safe mode, and retry transient downstream
//! errors with backoff. Acknowledgement stays with the dispatcher: each
//! dispatch round ends with a barrier across the workers, and only then do
//! the round's transactions go out on the `successes` channel, in receipt
//! order, so a lagging worker can never let a later commit overtake an
//! unapplied earlier one.
//!
//! The downstream database is an external collaborator behind the
//! [`Executor`] trait.

#![warn(clippy::all)]

mod causality;
mod executor;
mod loader;
mod model;
mod sqlite;

pub use causality::Causality;
pub use executor::{ExecuteError, Executor, MemoryExecutor};
pub use loader::{Loader, LoaderConfig};
pub use model::{Ddl, Dml, DmlType, Statement, TableMeta, Txn, Value};
pub use sqlite::SqliteExecutor;

/// Errors from the loader.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The downstream rejected a statement permanently, or retries ran out.
    #[error("downstream execution failed: {0}")]
    Execute(#[from] ExecuteError),

    /// A worker channel closed unexpectedly.
    #[error("loader channel closed")]
    ChannelClosed,

    /// A worker task panicked or was aborted.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
