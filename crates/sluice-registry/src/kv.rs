//! The consensus KV seam and its in-process implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::RegistryError;

/// A raw change observed on a watched prefix.
#[derive(Debug, Clone)]
pub enum KvEvent {
    /// A key was created or its value replaced.
    Put {
        /// Full key.
        key: String,
        /// New value.
        value: Vec<u8>,
    },
    /// A key was deleted or its lease expired.
    Delete {
        /// Full key.
        key: String,
    },
}

impl KvEvent {
    /// The key this event is about.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Minimal surface the registry needs from a consensus KV store.
///
/// Real deployments adapt their cluster's store to this trait; tests and
/// standalone mode use [`MemKvStore`].
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write `value` under `key`. With a TTL the key carries a session
    /// lease and disappears unless [`KvStore::keep_alive`] is called in time.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease_ttl: Option<Duration>,
    ) -> Result<(), RegistryError>;

    /// All live `(key, value)` pairs under a prefix.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, RegistryError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), RegistryError>;

    /// Extend the lease of a key previously put with a TTL.
    async fn keep_alive(&self, key: &str) -> Result<(), RegistryError>;

    /// Subscribe to changes under any key. Callers filter by prefix.
    fn watch(&self) -> broadcast::Receiver<KvEvent>;
}

struct MemEntry {
    value: Vec<u8>,
    ttl: Option<Duration>,
    deadline: Option<Instant>,
}

/// In-memory [`KvStore`] with real lease expiry.
///
/// A background sweeper deletes expired keys and publishes the matching
/// [`KvEvent::Delete`] events, so a pump that stops refreshing its lease is
/// observed exactly the way it would be on a real consensus store.
pub struct MemKvStore {
    entries: Arc<Mutex<BTreeMap<String, MemEntry>>>,
    events: broadcast::Sender<KvEvent>,
    sweeper: CancellationToken,
}

impl MemKvStore {
    /// Creates the store and starts the expiry sweeper.
    #[must_use]
    pub fn new() -> Self {
        let entries: Arc<Mutex<BTreeMap<String, MemEntry>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let (events, _) = broadcast::channel(256);
        let sweeper = CancellationToken::new();

        let sweep_entries = Arc::clone(&entries);
        let sweep_events = events.clone();
        let sweep_token = sweeper.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(20));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = sweep_token.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let now = Instant::now();
                let expired: Vec<String> = {
                    let mut map = sweep_entries.lock();
                    let keys: Vec<String> = map
                        .iter()
                        .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in &keys {
                        map.remove(key);
                    }
                    keys
                };
                for key in expired {
                    tracing::debug!(%key, "lease expired");
                    let _ = sweep_events.send(KvEvent::Delete { key });
                }
            }
        });

        Self {
            entries,
            events,
            sweeper,
        }
    }
}

impl Default for MemKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemKvStore {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

#[async_trait]
impl KvStore for MemKvStore {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease_ttl: Option<Duration>,
    ) -> Result<(), RegistryError> {
        {
            let mut map = self.entries.lock();
            map.insert(
                key.to_string(),
                MemEntry {
                    value: value.clone(),
                    ttl: lease_ttl,
                    deadline: lease_ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        }
        let _ = self.events.send(KvEvent::Put {
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, RegistryError> {
        let map = self.entries.lock();
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let removed = self.entries.lock().remove(key).is_some();
        if removed {
            let _ = self.events.send(KvEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn keep_alive(&self, key: &str) -> Result<(), RegistryError> {
        let mut map = self.entries.lock();
        let entry = map
            .get_mut(key)
            .ok_or_else(|| RegistryError::NoLease(key.to_string()))?;
        let Some(ttl) = entry.ttl else {
            return Err(RegistryError::NoLease(key.to_string()));
        };
        entry.deadline = Some(Instant::now() + ttl);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<KvEvent> {
        self.events.subscribe()
    }
}
