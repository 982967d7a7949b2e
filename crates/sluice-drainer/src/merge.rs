//! K-way merge across all pump sources, ordered by commit timestamp.
//!
//! The merger holds one head item per active source and emits the minimal
//! head each step. It can only proceed while every non-paused source has a
//! head: an open-but-empty channel stalls the merge (a slow pump must not
//! be overtaken), while a closed-and-drained channel is excluded until the
//! collector removes it. Output commit timestamps are strictly monotone.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of each source channel and of the output channel.
pub const MERGE_CHAN_SIZE: usize = 10;

/// Sleep between retries while some source has no head.
const STALL_WAIT: Duration = Duration::from_millis(100);

/// Anything the merger can order.
pub trait Mergeable: Send + 'static {
    /// Globally ordered commit timestamp.
    fn commit_ts(&self) -> i64;
}

/// One input source: an id and its bounded item channel.
pub struct MergeSource<T> {
    /// Source id, also the tie-breaker for equal timestamps.
    pub id: String,
    /// Item channel fed by the source's puller.
    pub rx: mpsc::Receiver<T>,
}

enum SourceOp<T> {
    Add(MergeSource<T>),
    Remove(String),
    Pause(String),
    Resume(String),
}

struct ActiveSource<T> {
    rx: mpsc::Receiver<T>,
    paused: bool,
    /// Channel closed and drained; excluded from the head-wait.
    finished: bool,
}

/// Handle to the running merge task.
pub struct Merger<T: Mergeable> {
    ops: Arc<Mutex<Vec<SourceOp<T>>>>,
    token: CancellationToken,
    output: Option<mpsc::Receiver<T>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Mergeable> Merger<T> {
    /// Spawns the merge task over an initial source set.
    #[must_use]
    pub fn spawn(sources: Vec<MergeSource<T>>) -> Self {
        let ops: Arc<Mutex<Vec<SourceOp<T>>>> = Arc::new(Mutex::new(
            sources.into_iter().map(SourceOp::Add).collect(),
        ));
        let (out_tx, out_rx) = mpsc::channel(MERGE_CHAN_SIZE);
        let token = CancellationToken::new();
        let join = tokio::spawn(run_merge(Arc::clone(&ops), out_tx, token.clone()));
        Self {
            ops,
            token,
            output: Some(out_rx),
            join: Mutex::new(Some(join)),
        }
    }

    /// Stages a new source; it becomes active on the next iteration.
    pub fn add_source(&self, source: MergeSource<T>) {
        self.ops.lock().push(SourceOp::Add(source));
    }

    /// Stages removal: the source's head item is discarded.
    pub fn remove_source(&self, id: &str) {
        self.ops.lock().push(SourceOp::Remove(id.to_string()));
    }

    /// Stages a pause: the source stops being read, but an already-fetched
    /// head still participates so ordering cannot regress on resume.
    pub fn pause_source(&self, id: &str) {
        self.ops.lock().push(SourceOp::Pause(id.to_string()));
    }

    /// Stages a resume.
    pub fn resume_source(&self, id: &str) {
        self.ops.lock().push(SourceOp::Resume(id.to_string()));
    }

    /// Takes the output receiver; callable once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<T>> {
        self.output.take()
    }

    /// Stops the merge task and waits for it. Safe to call from any
    /// holder of the merger; later calls are no-ops.
    pub async fn close(&self) {
        self.token.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run_merge<T: Mergeable>(
    ops: Arc<Mutex<Vec<SourceOp<T>>>>,
    output: mpsc::Sender<T>,
    token: CancellationToken,
) {
    let mut sources: BTreeMap<String, ActiveSource<T>> = BTreeMap::new();
    let mut heads: BTreeMap<String, T> = BTreeMap::new();
    let mut last_ts = i64::MIN;

    loop {
        if token.is_cancelled() {
            return;
        }

        // 1. Apply staged mutations.
        for op in ops.lock().drain(..) {
            match op {
                SourceOp::Add(source) => {
                    if sources.contains_key(&source.id) {
                        continue;
                    }
                    tracing::info!(source = %source.id, "merger add source");
                    sources.insert(
                        source.id,
                        ActiveSource {
                            rx: source.rx,
                            paused: false,
                            finished: false,
                        },
                    );
                }
                SourceOp::Remove(id) => {
                    if sources.remove(&id).is_some() {
                        heads.remove(&id);
                        tracing::info!(source = %id, "merger remove source");
                    }
                }
                SourceOp::Pause(id) => {
                    if let Some(s) = sources.get_mut(&id) {
                        s.paused = true;
                        tracing::info!(source = %id, "merger pause source");
                    }
                }
                SourceOp::Resume(id) => {
                    if let Some(s) = sources.get_mut(&id) {
                        s.paused = false;
                        tracing::info!(source = %id, "merger resume source");
                    }
                }
            }
        }

        // 2. Fill a head for every active source; stall if any is empty.
        let mut stalled = false;
        for (id, source) in &mut sources {
            if source.paused || source.finished || heads.contains_key(id) {
                continue;
            }
            match source.rx.try_recv() {
                Ok(item) => {
                    heads.insert(id.clone(), item);
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    // Open but empty: cannot overtake this source.
                    stalled = true;
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    tracing::warn!(source = %id, "merger source channel closed");
                    source.finished = true;
                }
            }
        }
        if stalled || heads.is_empty() {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(STALL_WAIT) => {}
            }
            continue;
        }

        // 3. Smallest commit ts wins; BTreeMap order breaks ties by id.
        let min_id = heads
            .iter()
            .min_by_key(|(_, item)| item.commit_ts())
            .map(|(id, _)| id.clone());
        let Some(min_id) = min_id else { continue };
        let Some(item) = heads.remove(&min_id) else {
            continue;
        };

        // 4. Never regress.
        if item.commit_ts() <= last_ts {
            tracing::error!(
                source = %min_id,
                ts = item.commit_ts(),
                last = last_ts,
                "merger dropping non-monotone item"
            );
            continue;
        }
        last_ts = item.commit_ts();

        tokio::select! {
            () = token.cancelled() => return,
            sent = output.send(item) => {
                if sent.is_err() {
                    // Downstream went away; nothing left to merge for.
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item(i64);

    impl Mergeable for Item {
        fn commit_ts(&self) -> i64 {
            self.0
        }
    }

    async fn feed(tx: &mpsc::Sender<Item>, values: &[i64]) {
        for v in values {
            tx.send(Item(*v)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_three_sources_merge_in_commit_order() {
        let (tx1, rx1) = mpsc::channel(MERGE_CHAN_SIZE);
        let (tx2, rx2) = mpsc::channel(MERGE_CHAN_SIZE);
        let (tx3, rx3) = mpsc::channel(MERGE_CHAN_SIZE);

        let mut merger = Merger::spawn(vec![
            MergeSource { id: "s1".into(), rx: rx1 },
            MergeSource { id: "s2".into(), rx: rx2 },
            MergeSource { id: "s3".into(), rx: rx3 },
        ]);
        let mut out = merger.take_output().unwrap();

        feed(&tx1, &[10, 20, 40]).await;
        feed(&tx2, &[15, 30]).await;
        feed(&tx3, &[25, 35, 50]).await;
        drop(tx1);
        drop(tx2);
        drop(tx3);

        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(out.recv().await.unwrap().0);
        }
        assert_eq!(seen, vec![10, 15, 20, 25, 30, 35, 40, 50]);
        merger.close().await;
    }

    #[tokio::test]
    async fn test_removed_source_discards_head_without_reemit() {
        let (tx1, rx1) = mpsc::channel(MERGE_CHAN_SIZE);
        let (tx2, rx2) = mpsc::channel(MERGE_CHAN_SIZE);

        let mut merger = Merger::spawn(vec![
            MergeSource { id: "s1".into(), rx: rx1 },
            MergeSource { id: "s2".into(), rx: rx2 },
        ]);
        let mut out = merger.take_output().unwrap();

        feed(&tx1, &[10, 20, 25]).await;
        feed(&tx2, &[15]).await;

        assert_eq!(out.recv().await.unwrap().0, 10);
        assert_eq!(out.recv().await.unwrap().0, 15);

        // s2 is now open-but-empty, so 20 cannot be emitted yet.
        let waited = tokio::time::timeout(Duration::from_millis(200), out.recv()).await;
        assert!(waited.is_err());

        // Removing s2 unblocks the merge; anything it sends later is lost.
        merger.remove_source("s2");
        assert_eq!(out.recv().await.unwrap().0, 20);
        assert_eq!(out.recv().await.unwrap().0, 25);
        let _ = tx2.send(Item(30)).await;
        drop(tx1);
        let end = tokio::time::timeout(Duration::from_millis(200), out.recv()).await;
        assert!(matches!(end, Ok(None) | Err(_)));
        merger.close().await;
    }

    #[tokio::test]
    async fn test_slow_source_stalls_the_merge() {
        let (tx1, rx1) = mpsc::channel(MERGE_CHAN_SIZE);
        let (tx2, rx2) = mpsc::channel(MERGE_CHAN_SIZE);

        let mut merger = Merger::spawn(vec![
            MergeSource { id: "s1".into(), rx: rx1 },
            MergeSource { id: "s2".into(), rx: rx2 },
        ]);
        let mut out = merger.take_output().unwrap();

        feed(&tx1, &[10, 20]).await;
        // s2 has no head yet: nothing may be emitted.
        let waited =
            tokio::time::timeout(Duration::from_millis(300), out.recv()).await;
        assert!(waited.is_err(), "merge proceeded without a head from s2");

        feed(&tx2, &[5]).await;
        assert_eq!(out.recv().await.unwrap().0, 5);
        assert_eq!(out.recv().await.unwrap().0, 10);

        drop(tx2);
        // s2 closed and drained: s1 flows alone now.
        assert_eq!(out.recv().await.unwrap().0, 20);
        merger.close().await;
        drop(tx1);
    }

    #[tokio::test]
    async fn test_non_monotone_head_is_dropped() {
        let (tx1, rx1) = mpsc::channel(MERGE_CHAN_SIZE);
        let mut merger = Merger::spawn(vec![MergeSource { id: "s1".into(), rx: rx1 }]);
        let mut out = merger.take_output().unwrap();

        feed(&tx1, &[10, 9, 11]).await;
        drop(tx1);

        assert_eq!(out.recv().await.unwrap().0, 10);
        // 9 regresses and is dropped.
        assert_eq!(out.recv().await.unwrap().0, 11);
        merger.close().await;
    }

    #[tokio::test]
    async fn test_added_source_participates() {
        let (tx1, rx1) = mpsc::channel(MERGE_CHAN_SIZE);
        let mut merger = Merger::spawn(vec![MergeSource { id: "s1".into(), rx: rx1 }]);
        let mut out = merger.take_output().unwrap();

        feed(&tx1, &[10]).await;
        assert_eq!(out.recv().await.unwrap().0, 10);

        let (tx2, rx2) = mpsc::channel(MERGE_CHAN_SIZE);
        merger.add_source(MergeSource { id: "s2".into(), rx: rx2 });
        feed(&tx2, &[12]).await;
        feed(&tx1, &[15]).await;

        assert_eq!(out.recv().await.unwrap().0, 12);
        assert_eq!(out.recv().await.unwrap().0, 15);
        merger.close().await;
    }

    #[tokio::test]
    async fn test_paused_source_does_not_stall() {
        let (tx1, rx1) = mpsc::channel(MERGE_CHAN_SIZE);
        let (keep_open, rx2) = mpsc::channel::<Item>(MERGE_CHAN_SIZE);
        let _keep_open = keep_open;

        let mut merger = Merger::spawn(vec![
            MergeSource { id: "s1".into(), rx: rx1 },
            MergeSource { id: "s2".into(), rx: rx2 },
        ]);
        let mut out = merger.take_output().unwrap();
        merger.pause_source("s2");

        feed(&tx1, &[10, 20]).await;
        assert_eq!(out.recv().await.unwrap().0, 10);
        assert_eq!(out.recv().await.unwrap().0, 20);
        merger.close().await;
    }
}
