//! Per-pump streaming puller.
//!
//! One puller owns the gRPC client for one registered pump. It pairs
//! prewrites with their commits by `start_ts`, so everything it emits
//! carries a real commit timestamp, and checks per-source monotonicity
//! before handing items to the merger. Reconnects are transparent: the
//! item channel stays open across them, closing only when the puller is
//! closed for good.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use prost::Message;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tonic::codec::CompressionEncoding;

use sluice_proto::pump::pump_client::PumpClient;
use sluice_proto::pump::PullBinlogReq;
use sluice_proto::{compare_pos, extract_physical, Binlog, BinlogType, Pos};

use crate::merge::{Mergeable, MERGE_CHAN_SIZE};
use crate::DrainerError;

/// Raised message cap, mirroring the pump server.
const MAX_MSG_SIZE: usize = 1024 * 1024 * 1024;

/// Sleep before redialing after a transport error.
const RECONNECT_WAIT: Duration = Duration::from_secs(1);

/// How often the receive loop re-checks the pause/close flags.
const FLAG_POLL: Duration = Duration::from_millis(500);

/// One merged, committed item flowing toward the syncer.
#[derive(Debug, Clone)]
pub struct BinlogItem {
    /// Pump node the item came from.
    pub node_id: String,
    /// Safe resume position: re-reading the source log from here
    /// reproduces every record this item has not already covered. It is
    /// the read cursor clamped back to the earliest prewrite still
    /// waiting for its commit, so an interleaved transaction is never
    /// skipped when a checkpointed position is replayed.
    pub pos: Pos,
    /// The record; for committed transactions this is the prewrite with
    /// its commit ts filled in.
    pub binlog: Binlog,
}

impl Mergeable for BinlogItem {
    fn commit_ts(&self) -> i64 {
        self.binlog.commit_ts
    }
}

/// Streaming client for one pump.
pub struct PumpPuller {
    node_id: String,
    addr: String,
    cluster_id: u64,
    is_closed: AtomicBool,
    is_paused: AtomicBool,
    latest_ts: AtomicI64,
    pos: Mutex<Pos>,
}

impl PumpPuller {
    #[must_use]
    pub fn new(node_id: impl Into<String>, addr: impl Into<String>, cluster_id: u64) -> Self {
        Self {
            node_id: node_id.into(),
            addr: addr.into(),
            cluster_id,
            is_closed: AtomicBool::new(false),
            is_paused: AtomicBool::new(false),
            latest_ts: AtomicI64::new(0),
            pos: Mutex::new(Pos::zero()),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Highest commit ts emitted so far.
    #[must_use]
    pub fn latest_ts(&self) -> i64 {
        self.latest_ts.load(Ordering::Acquire)
    }

    /// Position after the last received entity: the read frontier, used
    /// to reopen the stream after a reconnect. Checkpoints use the
    /// per-item safe position instead, never this.
    #[must_use]
    pub fn current_pos(&self) -> Pos {
        self.pos.lock().clone()
    }

    /// Stop pulling without tearing the channel down. Reentrant.
    pub fn pause(&self) {
        if self
            .is_paused
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!(pump = %self.node_id, "pause pulling");
        }
    }

    /// Resume after a pause. Reentrant.
    pub fn resume(&self) {
        if self
            .is_paused
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!(pump = %self.node_id, "continue pulling");
        }
    }

    /// Terminal stop; the pull task drains and closes its channel.
    pub fn close(&self) {
        if self
            .is_closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!(pump = %self.node_id, "closing puller");
        }
    }

    fn closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    fn paused(&self) -> bool {
        self.is_paused.load(Ordering::Acquire)
    }

    /// Spawns the pull task and returns the bounded item channel the
    /// merger reads from.
    #[must_use]
    pub fn pull(
        self: &Arc<Self>,
        start: Pos,
        err_tx: mpsc::Sender<DrainerError>,
    ) -> mpsc::Receiver<BinlogItem> {
        let (tx, rx) = mpsc::channel(MERGE_CHAN_SIZE);
        *self.pos.lock() = start;
        let puller = Arc::clone(self);
        tokio::spawn(async move {
            puller.run(tx, err_tx).await;
            tracing::debug!(pump = %puller.node_id, "pull task stopped");
        });
        rx
    }

    async fn run(&self, tx: mpsc::Sender<BinlogItem>, err_tx: mpsc::Sender<DrainerError>) {
        // Prewrites waiting for their commit record, keyed by start_ts;
        // each carries the position its record starts at so the safe
        // resume position can be clamped back to it.
        let mut pending: FxHashMap<i64, PendingPrewrite> = FxHashMap::default();
        let mut last_ts = i64::MIN;

        'connect: loop {
            if self.closed() {
                return;
            }
            if self.paused() {
                tokio::time::sleep(FLAG_POLL).await;
                continue;
            }

            let endpoint = format!("http://{}", self.addr);
            let mut client = match PumpClient::connect(endpoint).await {
                Ok(client) => client
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip)
                    .max_decoding_message_size(MAX_MSG_SIZE),
                Err(e) => {
                    tracing::warn!(pump = %self.node_id, error = %e, "dial failed");
                    tokio::time::sleep(RECONNECT_WAIT).await;
                    continue;
                }
            };

            let start_from = self.current_pos();
            tracing::info!(pump = %self.node_id, start = %start_from, "opening pull stream");
            let mut stream = match client
                .pull_binlogs(PullBinlogReq {
                    cluster_id: self.cluster_id,
                    start_from: Some(start_from),
                })
                .await
            {
                Ok(resp) => resp.into_inner(),
                Err(e) => {
                    tracing::warn!(pump = %self.node_id, error = %e, "open pull stream failed");
                    tokio::time::sleep(RECONNECT_WAIT).await;
                    continue;
                }
            };

            loop {
                if self.closed() {
                    return;
                }
                if self.paused() {
                    // Drop the stream while paused; reopen from the saved
                    // position on resume.
                    continue 'connect;
                }

                let message = tokio::select! {
                    message = stream.message() => message,
                    () = tokio::time::sleep(FLAG_POLL) => continue,
                };
                match message {
                    Ok(Some(resp)) => {
                        let Some(entity) = resp.entity else { continue };
                        // The cursor before the update is where this
                        // record starts.
                        let record_start = self.current_pos();
                        if let Some(pos) = &entity.pos {
                            *self.pos.lock() = pos.clone();
                        }
                        let binlog = match Binlog::decode(entity.payload.as_slice()) {
                            Ok(binlog) => binlog,
                            Err(e) => {
                                tracing::error!(pump = %self.node_id, error = %e, "unmarshal binlog failed");
                                let _ = err_tx.send(e.into()).await;
                                return;
                            }
                        };
                        if !self
                            .dispatch(binlog, record_start, &mut pending, &mut last_ts, &tx)
                            .await
                        {
                            return;
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(pump = %self.node_id, "pull stream ended by server");
                        tokio::time::sleep(RECONNECT_WAIT).await;
                        continue 'connect;
                    }
                    Err(status) => {
                        // A cancelled stream is the quiet path of our own
                        // shutdown; everything else is worth a log line.
                        if status.code() != tonic::Code::Cancelled {
                            tracing::warn!(pump = %self.node_id, error = %status, "receive binlog failed");
                        }
                        tokio::time::sleep(RECONNECT_WAIT).await;
                        continue 'connect;
                    }
                }
            }
        }
    }

    /// Routes one decoded record; returns false when the pull task must
    /// stop (item channel gone).
    async fn dispatch(
        &self,
        binlog: Binlog,
        record_start: Pos,
        pending: &mut FxHashMap<i64, PendingPrewrite>,
        last_ts: &mut i64,
        tx: &mpsc::Sender<BinlogItem>,
    ) -> bool {
        match binlog.tp() {
            BinlogType::Prewrite => {
                pending.insert(
                    binlog.start_ts,
                    PendingPrewrite {
                        binlog,
                        start: record_start,
                    },
                );
                true
            }
            BinlogType::Commit => match pending.remove(&binlog.start_ts) {
                Some(mut prewrite) => {
                    prewrite.binlog.commit_ts = binlog.commit_ts;
                    self.emit(prewrite.binlog, pending, last_ts, tx).await
                }
                None => {
                    // A checkpointed resume position from before this
                    // scheme, or one written by hand, can land between a
                    // prewrite and a commit that was already applied.
                    tracing::warn!(
                        pump = %self.node_id,
                        start_ts = binlog.start_ts,
                        "commit without matching prewrite, dropping"
                    );
                    true
                }
            },
            BinlogType::Rollback => {
                pending.remove(&binlog.start_ts);
                self.emit(binlog, pending, last_ts, tx).await
            }
            BinlogType::Ddl => self.emit(binlog, pending, last_ts, tx).await,
        }
    }

    async fn emit(
        &self,
        binlog: Binlog,
        pending: &FxHashMap<i64, PendingPrewrite>,
        last_ts: &mut i64,
        tx: &mpsc::Sender<BinlogItem>,
    ) -> bool {
        let ts = binlog.commit_ts;
        if ts <= *last_ts {
            tracing::error!(
                pump = %self.node_id,
                ts,
                last = *last_ts,
                "received unsorted binlog, dropping"
            );
            return true;
        }

        let lag_ms = now_ms().saturating_sub(extract_physical(ts));
        tracing::debug!(pump = %self.node_id, ts, lag_ms, "binlog received");

        let item = BinlogItem {
            node_id: self.node_id.clone(),
            pos: self.safe_pos(pending),
            binlog,
        };
        if tx.send(item).await.is_err() {
            // Merger removed us; nothing left to do.
            return false;
        }
        *last_ts = ts;
        self.latest_ts.store(ts, Ordering::Release);
        true
    }

    /// The read cursor, clamped back to the earliest prewrite still
    /// waiting for its commit. Replaying the log from here reproduces
    /// every transaction not yet emitted.
    fn safe_pos(&self, pending: &FxHashMap<i64, PendingPrewrite>) -> Pos {
        let mut safe = self.current_pos();
        for entry in pending.values() {
            if compare_pos(&entry.start, &safe) == std::cmp::Ordering::Less {
                safe = entry.start.clone();
            }
        }
        safe
    }
}

struct PendingPrewrite {
    binlog: Binlog,
    /// Position of the first byte of the prewrite's record.
    start: Pos,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
