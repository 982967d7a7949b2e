//! Node membership on top of the KV seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{KvEvent, KvStore, RegistryError};

/// Prefix all pump registrations live under.
pub const PUMP_PREFIX: &str = "pumps/";

/// Lifecycle state a pump advertises about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Serving writes and pulls.
    Online,
    /// Registered but not to be pulled from.
    Paused,
    /// Shutting down.
    Offline,
}

/// The JSON document stored under `pumps/<node_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Stable node identifier.
    pub node_id: String,
    /// gRPC address drainers dial.
    pub host: String,
    /// Advertised state.
    pub state: NodeState,
}

/// Lifecycle events a drainer observes about the pump fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A pump appeared (includes the initial snapshot on subscribe).
    Added(NodeStatus),
    /// A pump's registration vanished: deregistered or lease expired.
    Removed(String),
    /// A pump re-published its status with a different state.
    StateChanged(NodeStatus),
}

/// Membership operations for one prefix of the KV store.
pub struct NodeRegistry {
    kv: Arc<dyn KvStore>,
    lease_ttl: Duration,
    refresh_interval: Duration,
}

impl NodeRegistry {
    /// A registry with the given lease TTL; the refresh loop renews at a
    /// third of the TTL.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, lease_ttl: Duration) -> Self {
        Self {
            kv,
            lease_ttl,
            refresh_interval: lease_ttl / 3,
        }
    }

    fn key(node_id: &str) -> String {
        format!("{PUMP_PREFIX}{node_id}")
    }

    /// Publish the node's status under a fresh session lease.
    pub async fn register(&self, status: &NodeStatus) -> Result<(), RegistryError> {
        let value = serde_json::to_vec(status).map_err(|e| RegistryError::Kv(e.to_string()))?;
        self.kv
            .put(&Self::key(&status.node_id), value, Some(self.lease_ttl))
            .await?;
        tracing::info!(node = %status.node_id, state = ?status.state, "registered node");
        Ok(())
    }

    /// Re-publish with a new state, keeping the lease.
    pub async fn update_state(
        &self,
        status: &NodeStatus,
    ) -> Result<(), RegistryError> {
        self.register(status).await
    }

    /// Remove the node's registration.
    pub async fn unregister(&self, node_id: &str) -> Result<(), RegistryError> {
        self.kv.delete(&Self::key(node_id)).await?;
        tracing::info!(node = %node_id, "unregistered node");
        Ok(())
    }

    /// Keeps the node's lease alive until the token is cancelled.
    /// Refresh failures are logged and retried on the next tick; the
    /// lease TTL gives the operator the slack to notice.
    pub async fn refresh_loop(&self, node_id: &str, token: CancellationToken) {
        let key = Self::key(node_id);
        let mut tick = tokio::time::interval(self.refresh_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => return,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.kv.keep_alive(&key).await {
                tracing::warn!(node = %node_id, error = %e, "lease refresh failed");
            }
        }
    }

    /// Current snapshot of registered pumps.
    pub async fn nodes(&self) -> Result<Vec<NodeStatus>, RegistryError> {
        let pairs = self.kv.get_prefix(PUMP_PREFIX).await?;
        let mut out = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            out.push(decode_status(&key, &value)?);
        }
        Ok(out)
    }

    /// Streams [`NodeEvent`]s: the current snapshot as `Added`, then live
    /// changes until the token is cancelled.
    pub async fn watch(
        &self,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<NodeEvent>, RegistryError> {
        // Subscribe before the snapshot so no event can slip in between.
        let mut raw = self.kv.watch();
        let snapshot = self.nodes().await?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut known: HashMap<String, NodeState> = HashMap::new();
            for status in snapshot {
                known.insert(status.node_id.clone(), status.state);
                if tx.send(NodeEvent::Added(status)).await.is_err() {
                    return;
                }
            }

            loop {
                let event = tokio::select! {
                    () = token.cancelled() => return,
                    event = raw.recv() => event,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "registry watcher lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                };
                let Some(node_id) = event.key().strip_prefix(PUMP_PREFIX) else {
                    continue;
                };
                let node_id = node_id.to_string();
                let out = match event {
                    KvEvent::Put { ref key, ref value } => match decode_status(key, value) {
                        Ok(status) => match known.insert(node_id, status.state) {
                            None => NodeEvent::Added(status),
                            Some(prev) if prev != status.state => {
                                NodeEvent::StateChanged(status)
                            }
                            Some(_) => continue,
                        },
                        Err(e) => {
                            tracing::error!(error = %e, "skipping malformed registration");
                            continue;
                        }
                    },
                    KvEvent::Delete { .. } => {
                        if known.remove(&node_id).is_none() {
                            continue;
                        }
                        NodeEvent::Removed(node_id)
                    }
                };
                if tx.send(out).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

fn decode_status(key: &str, value: &[u8]) -> Result<NodeStatus, RegistryError> {
    serde_json::from_slice(value).map_err(|source| RegistryError::Decode {
        key: key.to_string(),
        source,
    })
}
