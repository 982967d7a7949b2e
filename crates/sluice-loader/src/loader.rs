//! The loader itself: dispatcher, worker pool, batching, safe mode.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHasher;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::causality::Causality;
use crate::executor::{ExecuteError, Executor};
use crate::model::{Statement, Txn};
use crate::LoaderError;

/// Tunables for a loader instance.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Parallel DML workers. 1 keeps everything strictly ordered.
    pub worker_count: usize,
    /// Transactions batched into one downstream commit.
    pub batch_size: usize,
    /// Force single-channel dispatch even with many workers.
    pub disable_dispatch: bool,
    /// Capacity of the input channel.
    pub input_capacity: usize,
    /// Capacity of the successes channel.
    pub success_capacity: usize,
    /// Give up retrying a transient downstream error after this long.
    pub retry_budget: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_count: 16,
            batch_size: 20,
            disable_dispatch: false,
            input_capacity: 512,
            success_capacity: 512,
            retry_budget: Duration::from_secs(30),
        }
    }
}

enum WorkerCmd {
    Txn(Txn),
    /// Barrier: commit everything pending, then ack.
    Flush(oneshot::Sender<()>),
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkerCmd>,
    join: JoinHandle<Result<(), LoaderError>>,
}

/// Handle to a running loader.
///
/// Feed transactions through [`Loader::input`]; every committed one comes
/// back on the successes channel for checkpointing. Dropping all input
/// senders drains and stops the loader; [`Loader::close`] waits for that
/// and surfaces the first worker error.
pub struct Loader {
    input: mpsc::Sender<Txn>,
    successes: Option<mpsc::Receiver<Txn>>,
    safe_mode: Arc<AtomicBool>,
    join: JoinHandle<Result<(), LoaderError>>,
}

impl Loader {
    /// Spawns the dispatcher and its workers.
    #[must_use]
    pub fn spawn(executor: Arc<dyn Executor>, cfg: LoaderConfig) -> Self {
        let (input_tx, input_rx) = mpsc::channel(cfg.input_capacity);
        let (success_tx, success_rx) = mpsc::channel(cfg.success_capacity);
        let safe_mode = Arc::new(AtomicBool::new(false));

        let worker_count = if cfg.disable_dispatch {
            1
        } else {
            cfg.worker_count.max(1)
        };
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel(cfg.input_capacity.max(1));
            let join = tokio::spawn(run_worker(
                id,
                rx,
                Arc::clone(&executor),
                Arc::clone(&safe_mode),
                cfg.clone(),
            ));
            workers.push(WorkerHandle { tx, join });
        }

        let join = tokio::spawn(run_dispatcher(
            input_rx,
            workers,
            executor,
            success_tx,
            cfg,
        ));

        Self {
            input: input_tx,
            successes: Some(success_rx),
            safe_mode,
            join,
        }
    }

    /// Sender side of the input channel.
    #[must_use]
    pub fn input(&self) -> mpsc::Sender<Txn> {
        self.input.clone()
    }

    /// Takes the successes receiver; callable once.
    pub fn take_successes(&mut self) -> Option<mpsc::Receiver<Txn>> {
        self.successes.take()
    }

    /// Toggle idempotent DML forms.
    pub fn set_safe_mode(&self, on: bool) {
        self.safe_mode.store(on, Ordering::Release);
        tracing::info!(safe_mode = on, "loader safe mode switched");
    }

    /// Enables safe mode now and schedules it off after `window`. Used
    /// after an abnormal-quit restart.
    pub fn enable_safe_mode_for(&self, window: Duration) {
        self.set_safe_mode(true);
        let flag = Arc::clone(&self.safe_mode);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            flag.store(false, Ordering::Release);
            tracing::info!("loader safe mode window elapsed");
        });
    }

    /// Drops the input side, waits for drain, returns the first failure.
    pub async fn close(self) -> Result<(), LoaderError> {
        drop(self.input);
        drop(self.successes);
        self.join.await?
    }
}

fn worker_index(representative: &str, worker_count: usize) -> usize {
    let mut hasher = FxHasher::default();
    representative.hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)]
    {
        (hasher.finish() as usize) % worker_count
    }
}

/// The dispatcher owns success emission: transactions are dispatched to
/// workers round by round, every round ends with a barrier that waits for
/// all workers to commit, and only then are the round's transactions
/// acknowledged, in the exact order they arrived. Workers never touch the
/// successes channel, so a slow or retrying worker can never let a later
/// commit ts overtake an unapplied earlier one.
async fn run_dispatcher(
    mut input: mpsc::Receiver<Txn>,
    workers: Vec<WorkerHandle>,
    executor: Arc<dyn Executor>,
    success_tx: mpsc::Sender<Txn>,
    cfg: LoaderConfig,
) -> Result<(), LoaderError> {
    let mut causality = Causality::new();
    // Dispatched but not yet acknowledged, in receipt order.
    let mut round: Vec<Txn> = Vec::new();
    let round_capacity = cfg.batch_size * workers.len();
    let mut result = Ok(());

    loop {
        // Block only while nothing is in flight; with an open round, an
        // idle input means it is time to commit what we have.
        let txn = if round.is_empty() {
            match input.recv().await {
                Some(txn) => txn,
                None => break,
            }
        } else {
            match input.try_recv() {
                Ok(txn) => txn,
                Err(mpsc::error::TryRecvError::Empty) => {
                    if let Err(e) = commit_round(&workers, &success_tx, &mut round).await {
                        result = Err(e);
                        break;
                    }
                    continue;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        };

        if txn.is_ddl() {
            // Schema change: commit everything in flight, then run it
            // alone and forget the causality groups it invalidates.
            if let Err(e) = commit_round(&workers, &success_tx, &mut round).await {
                result = Err(e);
                break;
            }
            causality.reset();
            let ddl_result = match &txn.ddl {
                Some(ddl) => {
                    let applied = execute_ddl_with_retry(
                        executor.as_ref(),
                        &ddl.database,
                        &ddl.sql,
                        cfg.retry_budget,
                    )
                    .await;
                    match &applied {
                        Ok(()) => {
                            tracing::info!(database = %ddl.database, sql = %ddl.sql, "applied ddl");
                        }
                        Err(e) => {
                            tracing::error!(database = %ddl.database, sql = %ddl.sql, error = %e, "ddl failed");
                        }
                    }
                    applied
                }
                None => Ok(()),
            };
            match ddl_result {
                Ok(()) => {
                    if success_tx.send(txn).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
            continue;
        }

        if !txn.dmls.is_empty() {
            let keys = txn.keys();
            if causality.detect_conflict(&keys) {
                // The txn would bridge two groups living on two workers:
                // commit everything so receipt order is safe, then regroup.
                if let Err(e) = commit_round(&workers, &success_tx, &mut round).await {
                    result = Err(e);
                    break;
                }
                causality.reset();
            }
            let representative = causality.add(&keys).unwrap_or_default();
            let idx = if workers.len() == 1 {
                0
            } else {
                worker_index(&representative, workers.len())
            };
            if workers[idx]
                .tx
                .send(WorkerCmd::Txn(txn.clone()))
                .await
                .is_err()
            {
                result = Err(LoaderError::ChannelClosed);
                break;
            }
        }
        // Empty transactions carry no work but still acknowledge in order.
        round.push(txn);

        if round.len() >= round_capacity {
            if let Err(e) = commit_round(&workers, &success_tx, &mut round).await {
                result = Err(e);
                break;
            }
        }
    }

    if result.is_ok() {
        if let Err(e) = commit_round(&workers, &success_tx, &mut round).await {
            result = Err(e);
        }
    }

    // Input closed (or a failure broke the loop): stop the workers and
    // surface the first error.
    let mut first_err = result.err();
    for worker in workers {
        drop(worker.tx);
        match worker.join.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // A dead worker makes the dispatcher see a closed channel;
                // the worker's own failure is the interesting one.
                if matches!(first_err, None | Some(LoaderError::ChannelClosed)) {
                    first_err = Some(e);
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e.into());
                }
            }
        }
    }
    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// The round barrier: every worker commits its pending batch (in
/// parallel), then the round's transactions go out on the successes
/// channel in the order they were received.
async fn commit_round(
    workers: &[WorkerHandle],
    success_tx: &mpsc::Sender<Txn>,
    round: &mut Vec<Txn>,
) -> Result<(), LoaderError> {
    if round.is_empty() {
        // Every dispatched txn sits in the round until acknowledged, so
        // an empty round means the workers are idle too.
        return Ok(());
    }
    flush_workers(workers).await?;
    for txn in round.drain(..) {
        // The receiver going away just means nobody checkpoints anymore;
        // that only happens during shutdown.
        if success_tx.send(txn).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn flush_workers(workers: &[WorkerHandle]) -> Result<(), LoaderError> {
    let mut acks = Vec::with_capacity(workers.len());
    for worker in workers {
        let (ack_tx, ack_rx) = oneshot::channel();
        if worker.tx.send(WorkerCmd::Flush(ack_tx)).await.is_err() {
            return Err(LoaderError::ChannelClosed);
        }
        acks.push(ack_rx);
    }
    for ack in acks {
        ack.await.map_err(|_| LoaderError::ChannelClosed)?;
    }
    Ok(())
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::Receiver<WorkerCmd>,
    executor: Arc<dyn Executor>,
    safe_mode: Arc<AtomicBool>,
    cfg: LoaderConfig,
) -> Result<(), LoaderError> {
    let mut pending: Vec<Txn> = Vec::new();

    loop {
        let Some(cmd) = rx.recv().await else {
            // Dispatcher is gone: apply what's left and stop.
            apply_pending(&executor, &safe_mode, &cfg, &mut pending).await?;
            return Ok(());
        };
        match cmd {
            WorkerCmd::Txn(txn) => {
                pending.push(txn);
                if pending.len() >= cfg.batch_size {
                    if let Err(e) =
                        apply_pending(&executor, &safe_mode, &cfg, &mut pending).await
                    {
                        tracing::error!(worker = id, error = %e, "worker batch failed");
                        return Err(e);
                    }
                }
            }
            WorkerCmd::Flush(ack) => {
                match apply_pending(&executor, &safe_mode, &cfg, &mut pending).await {
                    Ok(()) => {
                        let _ = ack.send(());
                    }
                    Err(e) => {
                        tracing::error!(worker = id, error = %e, "worker batch failed");
                        // Dropping the ack tells the dispatcher the
                        // barrier broke; the join carries the cause.
                        drop(ack);
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Applies everything pending as one downstream transaction. The round
/// barrier acknowledges; this only executes.
async fn apply_pending(
    executor: &Arc<dyn Executor>,
    safe_mode: &AtomicBool,
    cfg: &LoaderConfig,
    pending: &mut Vec<Txn>,
) -> Result<(), LoaderError> {
    if pending.is_empty() {
        return Ok(());
    }
    let safe = safe_mode.load(Ordering::Acquire);
    let stmts: Vec<Statement> = pending
        .iter()
        .flat_map(|txn| txn.dmls.iter())
        .flat_map(|dml| dml.statements(safe))
        .collect();

    execute_dml_with_retry(executor.as_ref(), stmts, cfg.retry_budget).await?;
    pending.clear();
    Ok(())
}

async fn execute_dml_with_retry(
    executor: &dyn Executor,
    stmts: Vec<Statement>,
    budget: Duration,
) -> Result<(), LoaderError> {
    let op = || async {
        executor.execute_dml(stmts.clone()).await.map_err(|e| match e {
            ExecuteError::Retryable(_) => {
                tracing::warn!(error = %e, "retryable downstream error");
                backoff::Error::transient(e)
            }
            ExecuteError::Permanent(_) => backoff::Error::permanent(e),
        })
    };
    let policy = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_max_elapsed_time(Some(budget))
        .build();
    backoff::future::retry(policy, op).await.map_err(Into::into)
}

async fn execute_ddl_with_retry(
    executor: &dyn Executor,
    database: &str,
    sql: &str,
    budget: Duration,
) -> Result<(), LoaderError> {
    let op = || async {
        executor.execute_ddl(database, sql).await.map_err(|e| match e {
            ExecuteError::Retryable(_) => backoff::Error::transient(e),
            ExecuteError::Permanent(_) => backoff::Error::permanent(e),
        })
    };
    let policy = backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_max_elapsed_time(Some(budget))
        .build();
    backoff::future::retry(policy, op).await.map_err(Into::into)
}
