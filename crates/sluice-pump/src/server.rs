//! The pump gRPC server: per-cluster binloggers behind a dispatcher map,
//! a streaming pull loop, the fake-binlog heartbeat, and segment GC.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use prost::Message;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::{Request, Response, Status};

use sluice_proto::pump::pump_server::{Pump, PumpServer};
use sluice_proto::pump::{PullBinlogReq, PullBinlogResp, WriteBinlogReq, WriteBinlogResp};
use sluice_proto::{Binlog, Pos};
use sluice_registry::{NodeRegistry, NodeState, NodeStatus};
use sluice_storage::{Binlogger, Options};

use crate::oracle::TimestampOracle;
use crate::{PumpConfig, PumpError};

/// Raised gRPC message cap: a prewrite can carry a large transaction.
const MAX_MSG_SIZE: usize = 1024 * 1024 * 1024;

/// Entities fetched per storage read in the pull loop.
const PULL_BATCH: usize = 1000;

/// Idle sleep between pull rounds, bounds CPU when the log is quiet.
const PULL_INTERVAL: Duration = Duration::from_millis(50);

/// Sweep interval of the GC task.
const GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub(crate) struct State {
    clusters_dir: PathBuf,
    opts: Options,
    /// Open binloggers indexed by cluster id.
    dispatcher: RwLock<FxHashMap<u64, Arc<Binlogger>>>,
    /// Set on every heartbeat tick, cleared by `WriteBinlog`; a tick that
    /// finds it still set knows the pump sat idle for a whole interval.
    need_heartbeat: AtomicBool,
    oracle: Arc<dyn TimestampOracle>,
}

impl State {
    /// Get-or-create the binlogger for a cluster, creating its directory
    /// on first write.
    fn writer(&self, cluster_id: u64) -> Result<Arc<Binlogger>, PumpError> {
        if let Some(bl) = self.dispatcher.read().get(&cluster_id) {
            return Ok(Arc::clone(bl));
        }
        let mut map = self.dispatcher.write();
        if let Some(bl) = map.get(&cluster_id) {
            return Ok(Arc::clone(bl));
        }
        let dir = self.clusters_dir.join(cluster_id.to_string());
        let bl = Arc::new(Binlogger::open_or_create(dir, self.opts)?);
        map.insert(cluster_id, Arc::clone(&bl));
        Ok(bl)
    }

    /// Read-only lookup; pulls never create a log.
    fn reader(&self, cluster_id: u64) -> Option<Arc<Binlogger>> {
        self.dispatcher.read().get(&cluster_id).map(Arc::clone)
    }

    async fn append(&self, cluster_id: u64, payload: Vec<u8>) -> Result<Pos, PumpError> {
        let bl = self.writer(cluster_id)?;
        let pos = tokio::task::spawn_blocking(move || bl.write_tail(&payload)).await??;
        Ok(pos)
    }

    /// Appends one rollback-typed record per open binlogger, stamping a
    /// fresh oracle timestamp.
    async fn write_fake_binlogs(&self) {
        let clusters: Vec<(u64, Arc<Binlogger>)> = self
            .dispatcher
            .read()
            .iter()
            .map(|(id, bl)| (*id, Arc::clone(bl)))
            .collect();
        for (cluster_id, bl) in clusters {
            let ts = match self.oracle.get_ts().await {
                Ok(ts) => ts,
                Err(e) => {
                    tracing::error!(error = %e, "heartbeat: fetch timestamp failed");
                    return;
                }
            };
            let payload = Binlog::fake(ts).encode_to_vec();
            let result = tokio::task::spawn_blocking(move || bl.write_tail(&payload)).await;
            match result {
                Ok(Ok(_)) => {
                    tracing::debug!(cluster = cluster_id, ts, "wrote fake binlog");
                }
                Ok(Err(e)) => {
                    tracing::error!(cluster = cluster_id, error = %e, "heartbeat: append failed");
                }
                Err(e) => {
                    tracing::error!(cluster = cluster_id, error = %e, "heartbeat: join failed");
                }
            }
        }
    }

    /// One heartbeat tick: emit fakes only if no write landed since the
    /// previous tick, then re-arm.
    pub(crate) async fn heartbeat_tick(&self) {
        if self.need_heartbeat.swap(true, Ordering::AcqRel) {
            self.write_fake_binlogs().await;
        }
    }
}

/// The pump server: owns the dispatcher state and background tasks.
pub struct Server {
    state: Arc<State>,
    cfg: PumpConfig,
    registry: Option<Arc<NodeRegistry>>,
    token: CancellationToken,
}

impl Server {
    /// Builds the server, reopening any cluster logs already on disk.
    pub fn new(
        cfg: PumpConfig,
        oracle: Arc<dyn TimestampOracle>,
        registry: Option<Arc<NodeRegistry>>,
    ) -> Result<Self, PumpError> {
        let clusters_dir = cfg.data_dir.join("clusters");
        std::fs::create_dir_all(&clusters_dir).map_err(sluice_storage::StorageError::Io)?;
        let opts = Options {
            segment_size: cfg.segment_size,
        };

        let mut dispatcher = FxHashMap::default();
        for entry in std::fs::read_dir(&clusters_dir).map_err(sluice_storage::StorageError::Io)? {
            let entry = entry.map_err(sluice_storage::StorageError::Io)?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(cluster_id) = name.parse::<u64>() else {
                continue;
            };
            let bl = Binlogger::open_with(entry.path(), opts)?;
            tracing::info!(cluster = cluster_id, "reopened cluster binlog");
            dispatcher.insert(cluster_id, Arc::new(bl));
        }

        Ok(Self {
            state: Arc::new(State {
                clusters_dir,
                opts,
                dispatcher: RwLock::new(dispatcher),
                need_heartbeat: AtomicBool::new(true),
                oracle,
            }),
            cfg,
            registry,
            token: CancellationToken::new(),
        })
    }

    /// Cancellation token whose children gate all background tasks.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// The tonic service with compression and the raised message cap.
    fn grpc_service(&self) -> PumpServer<Grpc> {
        PumpServer::new(Grpc {
            state: Arc::clone(&self.state),
            token: self.token.child_token(),
        })
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip)
        .max_decoding_message_size(MAX_MSG_SIZE)
        .max_encoding_message_size(MAX_MSG_SIZE)
    }

    /// Serves on the listener until [`Server::shutdown`]. Spawns the
    /// heartbeat, GC, and membership tasks.
    pub async fn run(&self, listener: tokio::net::TcpListener) -> Result<(), PumpError> {
        if let Some(registry) = &self.registry {
            let status = NodeStatus {
                node_id: self.cfg.node_id.clone(),
                host: self.cfg.listen_addr.clone(),
                state: NodeState::Online,
            };
            registry.register(&status).await?;
            let reg = Arc::clone(registry);
            let node_id = self.cfg.node_id.clone();
            let token = self.token.child_token();
            tokio::spawn(async move { reg.refresh_loop(&node_id, token).await });
        }

        let hb_state = Arc::clone(&self.state);
        let hb_interval = self.cfg.heartbeat_interval();
        let hb_token = self.token.child_token();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(hb_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = hb_token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                hb_state.heartbeat_tick().await;
            }
        });

        if self.cfg.gc_days > 0 {
            let gc_state = Arc::clone(&self.state);
            let retention = self.cfg.gc_retention();
            let gc_token = self.token.child_token();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(GC_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        () = gc_token.cancelled() => return,
                        _ = tick.tick() => {}
                    }
                    let clusters: Vec<Arc<Binlogger>> =
                        gc_state.dispatcher.read().values().map(Arc::clone).collect();
                    for bl in clusters {
                        let keep_from = bl.tail_pos();
                        let _ = tokio::task::spawn_blocking(move || bl.gc(retention, keep_from))
                            .await;
                    }
                }
            });
        }

        let token = self.token.clone();
        tracing::info!(addr = %self.cfg.listen_addr, "pump server started");
        tonic::transport::Server::builder()
            .add_service(self.grpc_service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                token.cancelled().await;
            })
            .await?;

        self.finish().await;
        Ok(())
    }

    /// Signals every task to stop; [`Server::run`] returns once the
    /// listener drains.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    async fn finish(&self) {
        if let Some(registry) = &self.registry {
            let status = NodeStatus {
                node_id: self.cfg.node_id.clone(),
                host: self.cfg.listen_addr.clone(),
                state: NodeState::Offline,
            };
            if let Err(e) = registry.update_state(&status).await {
                tracing::error!(error = %e, "publish offline state failed");
            }
            if let Err(e) = registry.unregister(&self.cfg.node_id).await {
                tracing::error!(error = %e, "unregister failed");
            }
        }
        for bl in self.state.dispatcher.read().values() {
            if let Err(e) = bl.close() {
                tracing::error!(error = %e, "close binlogger failed");
            }
        }
        tracing::info!("pump server stopped");
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> Arc<State> {
        Arc::clone(&self.state)
    }
}

struct Grpc {
    state: Arc<State>,
    token: CancellationToken,
}

#[tonic::async_trait]
impl Pump for Grpc {
    async fn write_binlog(
        &self,
        request: Request<WriteBinlogReq>,
    ) -> Result<Response<WriteBinlogResp>, Status> {
        let req = request.into_inner();
        // A real write landed: the next heartbeat tick stays quiet.
        self.state.need_heartbeat.store(false, Ordering::Release);
        let resp = match self.state.append(req.cluster_id, req.payload).await {
            Ok(_) => WriteBinlogResp::default(),
            Err(e) => {
                tracing::error!(cluster = req.cluster_id, error = %e, "write binlog failed");
                WriteBinlogResp {
                    errmsg: e.to_string(),
                }
            }
        };
        Ok(Response::new(resp))
    }

    type PullBinlogsStream = ReceiverStream<Result<PullBinlogResp, Status>>;

    async fn pull_binlogs(
        &self,
        request: Request<PullBinlogReq>,
    ) -> Result<Response<Self::PullBinlogsStream>, Status> {
        let req = request.into_inner();
        let Some(binlogger) = self.state.reader(req.cluster_id) else {
            return Err(Status::not_found(format!(
                "no binlog for cluster {}",
                req.cluster_id
            )));
        };
        let start = req.start_from.unwrap_or_default();
        let (tx, rx) = mpsc::channel(8);
        let token = self.token.child_token();
        tokio::spawn(pull_loop(binlogger, start, tx, token));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Streams entities by increasing position forever; ends only on client
/// cancel, server shutdown, or a fatal storage error.
async fn pull_loop(
    binlogger: Arc<Binlogger>,
    mut pos: Pos,
    tx: mpsc::Sender<Result<PullBinlogResp, Status>>,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            return;
        }
        let bl = Arc::clone(&binlogger);
        let from = pos.clone();
        let batch = tokio::task::spawn_blocking(move || bl.read_from(from, PULL_BATCH)).await;
        let batch = match batch {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "pull: storage read failed");
                let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                return;
            }
        };
        for entity in batch {
            if let Some(p) = &entity.pos {
                pos = p.clone();
            }
            if tx
                .send(Ok(PullBinlogResp {
                    entity: Some(entity),
                }))
                .await
                .is_err()
            {
                // Client hung up.
                return;
            }
        }
        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(PULL_INTERVAL) => {}
        }
    }
}
