//! Lease-based membership for pumps.
//!
//! Pumps register themselves under `pumps/<node_id>` in a consensus KV
//! store with a session lease and refresh the lease periodically; drainers
//! watch the prefix and translate raw KV events into node lifecycle events.
//!
//! The KV store itself is an external collaborator behind the [`KvStore`]
//! trait. [`MemKvStore`] implements it in-process with real lease expiry,
//! which is what the test suites and standalone deployments run on.

#![warn(clippy::all)]

mod kv;
mod node;

pub use kv::{KvEvent, KvStore, MemKvStore};
pub use node::{NodeEvent, NodeRegistry, NodeState, NodeStatus, PUMP_PREFIX};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The KV backend rejected or failed the operation.
    #[error("kv store error: {0}")]
    Kv(String),

    /// Refreshing a lease on a key that no longer exists.
    #[error("no lease for key {0}")]
    NoLease(String),

    /// A stored node status failed to decode.
    #[error("malformed node status under {key}: {source}")]
    Decode {
        /// The offending key.
        key: String,
        /// Decode failure.
        #[source]
        source: serde_json::Error,
    },
}
