//! Source collection: registry events drive the puller set.
//!
//! Neither the pump fleet nor the drainer hold pointers at one another;
//! both observe the consensus KV store. The collector translates node
//! lifecycle events into puller and merger mutations.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sluice_proto::Pos;
use sluice_registry::{NodeEvent, NodeRegistry, NodeState};

use crate::checkpoint::PosRecord;
use crate::merge::{MergeSource, Merger};
use crate::pump::{BinlogItem, PumpPuller};
use crate::DrainerError;

/// Watches the registry and keeps one puller per online pump.
pub struct Collector {
    pullers: Arc<Mutex<BTreeMap<String, Arc<PumpPuller>>>>,
    token: CancellationToken,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    /// Spawns the watcher task.
    ///
    /// `start_positions` are the checkpoint's applied-frontier resume
    /// positions; unknown pumps start from the log head.
    pub async fn spawn(
        registry: Arc<NodeRegistry>,
        merger: Arc<Merger<BinlogItem>>,
        cluster_id: u64,
        start_positions: BTreeMap<String, PosRecord>,
        err_tx: mpsc::Sender<DrainerError>,
    ) -> Result<Self, DrainerError> {
        let token = CancellationToken::new();
        let mut events = registry.watch(token.child_token()).await?;
        let pullers: Arc<Mutex<BTreeMap<String, Arc<PumpPuller>>>> =
            Arc::new(Mutex::new(BTreeMap::new()));

        let task_pullers = Arc::clone(&pullers);
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = task_token.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else { break };
                match event {
                    NodeEvent::Added(status) => {
                        if task_pullers.lock().contains_key(&status.node_id) {
                            continue;
                        }
                        let puller = Arc::new(PumpPuller::new(
                            status.node_id.clone(),
                            status.host.clone(),
                            cluster_id,
                        ));
                        let start: Pos = start_positions
                            .get(&status.node_id)
                            .copied()
                            .unwrap_or_default()
                            .into();
                        let rx = puller.pull(start, err_tx.clone());
                        merger.add_source(MergeSource {
                            id: status.node_id.clone(),
                            rx,
                        });
                        if status.state == NodeState::Paused {
                            puller.pause();
                            merger.pause_source(&status.node_id);
                        }
                        tracing::info!(pump = %status.node_id, host = %status.host, "collector added pump");
                        task_pullers.lock().insert(status.node_id, puller);
                    }
                    NodeEvent::Removed(node_id) => {
                        if let Some(puller) = task_pullers.lock().remove(&node_id) {
                            puller.close();
                            merger.remove_source(&node_id);
                            tracing::info!(pump = %node_id, "collector removed pump");
                        }
                    }
                    NodeEvent::StateChanged(status) => {
                        let puller = task_pullers.lock().get(&status.node_id).map(Arc::clone);
                        let Some(puller) = puller else { continue };
                        match status.state {
                            NodeState::Online => {
                                puller.resume();
                                merger.resume_source(&status.node_id);
                            }
                            NodeState::Paused | NodeState::Offline => {
                                puller.pause();
                                merger.pause_source(&status.node_id);
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            pullers,
            token,
            join: Mutex::new(Some(join)),
        })
    }

    /// Stops the watcher and closes every puller. Later calls are no-ops.
    pub async fn close(&self) {
        self.token.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
        for puller in self.pullers.lock().values() {
            puller.close();
        }
    }
}
