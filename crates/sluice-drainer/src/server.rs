//! The drainer supervisor: wires collector, merger, schema tracker,
//! translator, syncer, and checkpoint together and owns the shutdown
//! order. Worker errors land on one channel; the first one cancels the
//! root token, everything drains, and the checkpoint is flushed one last
//! time before the process gives up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prost::Message;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sluice_loader::Txn;
use sluice_proto::{BinlogType, DdlJob, PrewriteValue};
use sluice_registry::NodeRegistry;

use crate::checkpoint::{
    CheckPoint, CheckpointError, CheckpointRecord, CheckpointStatus, PosRecord,
};
use crate::collector::Collector;
use crate::merge::Merger;
use crate::pump::BinlogItem;
use crate::schema::SchemaTracker;
use crate::sync::Syncer;
use crate::translator::translate;
use crate::{DrainerConfig, DrainerError};

/// Safe-mode window after an abnormal-quit restart.
const SAFE_MODE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Interval of the checkpoint ticker; actual writes are further gated by
/// the backend's minimum save interval.
const SAVE_TICK: Duration = Duration::from_secs(1);

/// The drainer service.
pub struct Drainer {
    cfg: DrainerConfig,
    registry: Arc<NodeRegistry>,
    checkpoint: Arc<dyn CheckPoint>,
    syncer: Box<dyn Syncer>,
    tracker: SchemaTracker,
    token: CancellationToken,
}

impl Drainer {
    /// Builds the drainer: replays the historical job log into the
    /// schema tracker and keeps everything else lazy until [`Drainer::run`].
    pub fn new(
        cfg: DrainerConfig,
        registry: Arc<NodeRegistry>,
        checkpoint: Arc<dyn CheckPoint>,
        syncer: Box<dyn Syncer>,
        history: Vec<DdlJob>,
    ) -> Result<Self, DrainerError> {
        let tracker = SchemaTracker::new(history, cfg.ignore_schemas.iter().cloned())?;
        Ok(Self {
            cfg,
            registry,
            checkpoint,
            syncer,
            tracker,
            token: CancellationToken::new(),
        })
    }

    /// Token that stops the drainer cleanly when cancelled.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Runs the pipeline until cancellation or a fatal error.
    ///
    /// On a clean stop the final checkpoint is written with status
    /// `Normal`; on a fatal error it stays `Running` so the next start
    /// knows to enter safe mode.
    #[allow(clippy::too_many_lines)]
    pub async fn run(self) -> Result<(), DrainerError> {
        let Self {
            cfg,
            registry,
            checkpoint,
            mut syncer,
            mut tracker,
            token,
        } = self;

        // Resume point.
        let record = match checkpoint.load().await {
            Ok(record) => Some(record),
            Err(CheckpointError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        let start_ts = record
            .as_ref()
            .map_or(cfg.initial_commit_ts, |r| r.commit_ts);
        let positions = record
            .as_ref()
            .map(|r| r.positions.clone())
            .unwrap_or_default();
        let abnormal_quit = record
            .as_ref()
            .is_some_and(|r| r.status == CheckpointStatus::Running);
        tracing::info!(start_ts, abnormal_quit, "drainer resuming");

        if cfg.safe_mode {
            syncer.set_safe_mode(true);
        } else if abnormal_quit {
            // Until the window closes every DML the loader applies is
            // idempotent, so re-applied bundles converge.
            syncer.enable_safe_mode_for(SAFE_MODE_WINDOW);
        }

        let (err_tx, mut err_rx) = mpsc::channel::<DrainerError>(16);

        let mut merger = Merger::spawn(Vec::new());
        let mut output = merger.take_output().ok_or(DrainerError::ChannelClosed)?;
        let merger = Arc::new(merger);

        let collector = Collector::spawn(
            Arc::clone(&registry),
            Arc::clone(&merger),
            cfg.cluster_id,
            positions.clone(),
            err_tx.clone(),
        )
        .await?;

        let successes = syncer
            .take_successes()
            .ok_or(DrainerError::ChannelClosed)?;

        // Dedicated success-drain + checkpoint-tick task, so the apply
        // loop can block on a full sink without stalling acknowledgement
        // draining (that combination would deadlock the loader).
        let finish_ts = Arc::new(AtomicI64::new(start_ts));
        let tracked = Arc::new(PositionTracker::new(positions));
        let ckpt_token = token.child_token();
        let ckpt_task = tokio::spawn(run_checkpointer(
            Arc::clone(&checkpoint),
            successes,
            Arc::clone(&finish_ts),
            Arc::clone(&tracked),
            ckpt_token.clone(),
        ));

        // Apply loop: serial schema tracking + translation, preserving
        // the merge order into the syncer.
        let mut fatal: Option<DrainerError> = None;
        loop {
            tokio::select! {
                () = token.cancelled() => break,

                Some(e) = err_rx.recv() => {
                    tracing::error!(error = %e, "pipeline worker failed");
                    fatal = Some(e);
                    break;
                }

                item = output.recv() => {
                    let Some(item) = item else { break };
                    if let Err(e) =
                        apply_item(&mut tracker, &mut syncer, &tracked, item, start_ts).await
                    {
                        tracing::error!(error = %e, "apply failed");
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }

        // Orderly shutdown: stop pulling, stop merging, then close the
        // syncer while the checkpointer keeps draining acknowledgements.
        collector.close().await;
        merger.close().await;
        drop(output);

        if let Err(e) = syncer.close().await {
            tracing::error!(error = %e, "syncer close failed");
            if fatal.is_none() {
                fatal = Some(e);
            }
        }
        ckpt_token.cancel();
        let _ = ckpt_task.await;
        let finish_ts = finish_ts.load(Ordering::Acquire);

        // Final flush. A clean stop downgrades the status so the next
        // start skips safe mode.
        let status = if fatal.is_none() {
            CheckpointStatus::Normal
        } else {
            CheckpointStatus::Running
        };
        let record = build_record(finish_ts, status, tracked.snapshot());
        if let Err(e) = checkpoint.save(&record).await {
            tracing::error!(error = %e, "final checkpoint save failed");
            if fatal.is_none() {
                fatal = Some(e.into());
            }
        }
        tracing::info!(finish_ts, ?status, "drainer stopped");

        match fatal {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

/// Drains the syncer's acknowledgements, advances the finish timestamp
/// and the applied-frontier positions, and ticks the periodic save.
async fn run_checkpointer(
    checkpoint: Arc<dyn CheckPoint>,
    mut successes: mpsc::Receiver<Txn>,
    finish_ts: Arc<AtomicI64>,
    tracked: Arc<PositionTracker>,
    token: CancellationToken,
) {
    let mut save_tick = tokio::time::interval(SAVE_TICK);
    save_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = token.cancelled() => break,

            txn = successes.recv() => {
                let Some(txn) = txn else { break };
                finish_ts.fetch_max(txn.commit_ts, Ordering::AcqRel);
                tracked.ack_up_to(txn.commit_ts);
            }

            _ = save_tick.tick() => {
                if checkpoint.check() {
                    let ts = finish_ts.load(Ordering::Acquire);
                    let record = build_record(
                        ts,
                        CheckpointStatus::Running,
                        tracked.snapshot(),
                    );
                    match checkpoint.save(&record).await {
                        Ok(()) => tracing::debug!(finish_ts = ts, "checkpoint saved"),
                        Err(e) => {
                            tracing::error!(error = %e, "periodic checkpoint save failed");
                        }
                    }
                }
            }
        }
    }

    // Late acknowledgements from the syncer's drain still count.
    while let Ok(txn) = successes.try_recv() {
        finish_ts.fetch_max(txn.commit_ts, Ordering::AcqRel);
        tracked.ack_up_to(txn.commit_ts);
    }
}

fn build_record(
    finish_ts: i64,
    status: CheckpointStatus,
    positions: BTreeMap<String, PosRecord>,
) -> CheckpointRecord {
    let mut record = CheckpointRecord::new(finish_ts, status);
    record.positions = positions;
    record
}

/// Applied-frontier position bookkeeping.
///
/// Every item handed to the syncer is registered together with its safe
/// resume position; the position moves into the per-source frontier only
/// once the transaction is acknowledged. Items that never reach the sink
/// (heartbeats, ignored schemas, catch-up replay) advance the frontier
/// directly, but only while their source has nothing unacknowledged in
/// flight, so the stored positions never pass an unapplied record.
#[derive(Default)]
struct PositionTracker {
    inner: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    /// Synced-but-unacknowledged transactions, in commit order.
    pending: BTreeMap<i64, (String, PosRecord)>,
    /// Unacknowledged transaction count per source.
    in_flight: FxHashMap<String, usize>,
    /// Safe resume position per source.
    frontier: BTreeMap<String, PosRecord>,
}

impl PositionTracker {
    /// Seeds the frontier with the positions loaded from the checkpoint,
    /// so an idle restart re-persists what it started from.
    fn new(initial: BTreeMap<String, PosRecord>) -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                frontier: initial,
                ..TrackerState::default()
            }),
        }
    }

    /// Called before the transaction is handed to the syncer, so the
    /// acknowledgement can never race ahead of the registration.
    fn note_synced(&self, source: &str, commit_ts: i64, pos: PosRecord) {
        let mut state = self.inner.lock();
        state.pending.insert(commit_ts, (source.to_string(), pos));
        *state.in_flight.entry(source.to_string()).or_insert(0) += 1;
    }

    /// An item that produced nothing downstream still advances its
    /// source's frontier, unless an earlier transaction of the same
    /// source is still unacknowledged.
    fn note_passed(&self, source: &str, pos: PosRecord) {
        let mut state = self.inner.lock();
        if state.in_flight.get(source).copied().unwrap_or(0) == 0 {
            state.frontier.insert(source.to_string(), pos);
        }
    }

    /// Acknowledgements arrive in receipt order, so everything pending
    /// at or below `commit_ts` is applied and folds into the frontier.
    fn ack_up_to(&self, commit_ts: i64) {
        let mut state = self.inner.lock();
        let rest = state.pending.split_off(&(commit_ts + 1));
        let acked = std::mem::replace(&mut state.pending, rest);
        for (_, (source, pos)) in acked {
            if let Some(count) = state.in_flight.get_mut(&source) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.in_flight.remove(&source);
                }
            }
            state.frontier.insert(source, pos);
        }
    }

    fn snapshot(&self) -> BTreeMap<String, PosRecord> {
        self.inner.lock().frontier.clone()
    }
}


/// Applies one merged item: DDLs go through the tracker then (as a
/// barrier inside the loader) downstream; committed prewrites are
/// translated and synced; heartbeats only advance the clock. Items at or
/// below the checkpoint are catch-up replay and never reach the sink.
/// Every outcome is reported to the position tracker: synced items are
/// registered before the syncer sees them, everything else only nudges
/// the frontier.
async fn apply_item(
    tracker: &mut SchemaTracker,
    syncer: &mut Box<dyn Syncer>,
    tracked: &PositionTracker,
    item: BinlogItem,
    start_ts: i64,
) -> Result<(), DrainerError> {
    let BinlogItem {
        node_id,
        pos,
        binlog,
    } = item;
    let pos = PosRecord::from(pos);
    match binlog.tp() {
        BinlogType::Rollback => {
            tracked.note_passed(&node_id, pos);
            Ok(())
        }

        BinlogType::Ddl => {
            let Some(job) = binlog.ddl_job else {
                return Err(DrainerError::Schema(crate::schema::SchemaError::MalformedJob {
                    id: binlog.ddl_job_id,
                    reason: "ddl binlog without job".to_string(),
                }));
            };
            // Resolve the schema name before the job mutates the maps;
            // a drop-schema job can't be resolved afterwards.
            let database = job
                .schema_info
                .as_ref()
                .map(|s| s.name.clone())
                .or_else(|| tracker.schema_by_id(job.schema_id).ok().map(str::to_string))
                .unwrap_or_default();

            if binlog.commit_ts <= start_ts {
                // Catch-up replay keeps the snapshot consistent but must
                // not be re-applied downstream.
                if !tracker.has_applied(job.id) {
                    tracker.apply_job(&job)?;
                }
                tracked.note_passed(&node_id, pos);
                return Ok(());
            }

            tracker.apply_job(&job)?;
            if tracker.is_ignored(&database) {
                tracked.note_passed(&node_id, pos);
                return Ok(());
            }
            tracked.note_synced(&node_id, binlog.commit_ts, pos);
            syncer
                .sync(Txn::ddl(database, binlog.ddl_query, binlog.commit_ts))
                .await
        }

        BinlogType::Prewrite => {
            if binlog.commit_ts <= start_ts {
                tracked.note_passed(&node_id, pos);
                return Ok(());
            }
            let prewrite = PrewriteValue::decode(binlog.prewrite_value.as_slice())?;
            let dmls = translate(tracker, &prewrite, binlog.commit_ts)?;
            if dmls.is_empty() {
                tracked.note_passed(&node_id, pos);
                return Ok(());
            }
            tracked.note_synced(&node_id, binlog.commit_ts, pos);
            syncer.sync(Txn::dml(dmls, binlog.commit_ts)).await
        }

        BinlogType::Commit => {
            // Pullers pair commits with prewrites; a raw commit here
            // means a puller bug, not a data problem.
            tracing::error!(source = %node_id, "raw commit record reached the apply stage");
            Ok(())
        }
    }
}
