//! Batch-consuming worker pool.
//!
//! Each worker waits for the first queued event, tops the batch up with
//! whatever is already buffered, commits it through [`DedupStore`], and
//! records the outcome. Workers are peers sharing one queue; there is no
//! stealing or rebalancing beyond that.
//!
//! A batch that fails to persist is logged and dropped. There is no retry
//! and no dead-letter queue yet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::models::Event;
use crate::queue::IngestQueue;
use crate::stats::StatsTracker;
use crate::store::DedupStore;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default cap on events per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub workers: usize,
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// What happened to each worker during shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that exited on their own
    pub stopped: usize,
    /// Workers that panicked
    pub failed: usize,
    /// Workers still running at the deadline and aborted
    pub aborted: usize,
}

/// Running set of workers plus the signal that stops them.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("running", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawn `config.workers` workers onto the current tokio runtime.
    #[must_use]
    pub fn spawn(
        config: WorkerConfig,
        queue: Arc<IngestQueue>,
        store: DedupStore,
        stats: Arc<StatsTracker>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for n in 0..config.workers.max(1) {
            let worker = Worker {
                name: format!("consumer-{n}"),
                batch_size: config.batch_size.max(1),
                queue: Arc::clone(&queue),
                store: store.clone(),
                stats: Arc::clone(&stats),
                shutdown: shutdown_rx.clone(),
            };
            tasks.spawn(worker.run());
        }

        info!(
            workers = tasks.len(),
            batch_size = config.batch_size,
            "worker pool started"
        );
        Self { shutdown_tx, tasks }
    }

    /// Number of workers not yet joined.
    #[must_use]
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every worker to stop and wait up to `timeout` for them.
    ///
    /// Workers still running at the deadline are aborted; whatever batch
    /// they held is lost. Individual failures are logged, not returned.
    pub async fn shutdown(mut self, timeout: Duration) -> ShutdownReport {
        self.shutdown_tx.send_replace(true);
        info!(workers = self.tasks.len(), "shutting down worker pool");

        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok(()))) => report.stopped += 1,
                Ok(Some(Err(e))) => {
                    error!(error = %e, "worker terminated abnormally");
                    report.failed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = self.tasks.len(),
                        "workers did not stop in time, aborting"
                    );
                    self.tasks.abort_all();
                    while let Some(result) = self.tasks.join_next().await {
                        match result {
                            Err(e) if e.is_panic() => report.failed += 1,
                            Ok(()) => report.stopped += 1,
                            Err(_) => report.aborted += 1,
                        }
                    }
                    break;
                }
            }
        }

        info!(
            stopped = report.stopped,
            failed = report.failed,
            aborted = report.aborted,
            "worker pool stopped"
        );
        report
    }
}

/// One consumer loop and the handles it works with.
struct Worker {
    name: String,
    batch_size: usize,
    queue: Arc<IngestQueue>,
    store: DedupStore,
    stats: Arc<StatsTracker>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker = %self.name, "batch consumer started");

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                batch = self.queue.dequeue_batch(self.batch_size) => batch,
            };

            if batch.is_empty() {
                // Only happens once the queue has been torn down.
                break;
            }
            self.process(batch).await;
        }

        info!(worker = %self.name, "batch consumer stopped");
    }

    /// Persist one batch, record its outcome, then acknowledge it.
    async fn process(&self, batch: Vec<Event>) {
        let size = batch.len();
        let started = Instant::now();

        match self.store.batch_upsert(&batch).await {
            Ok(inserted) => {
                let size = size as u64;
                let new = inserted.min(size);
                let duplicates = size - new;
                self.stats.record_batch(new, duplicates);

                info!(
                    worker = %self.name,
                    batch = size,
                    new,
                    duplicates,
                    elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
                    "processed batch"
                );
            }
            Err(e) => {
                self.stats.record_failed(size as u64);
                error!(
                    worker = %self.name,
                    batch = size,
                    error = %e,
                    "failed to persist batch, dropping it"
                );
            }
        }

        self.queue.ack(size);
        debug!(worker = %self.name, pending = self.queue.pending(), "batch acknowledged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::event;
    use tempfile::tempdir;

    async fn setup(
        workers: usize,
        batch_size: usize,
    ) -> (tempfile::TempDir, Arc<IngestQueue>, DedupStore, Arc<StatsTracker>, WorkerPool) {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();
        let queue = Arc::new(IngestQueue::new());
        let stats = Arc::new(StatsTracker::new());
        let pool = WorkerPool::spawn(
            WorkerConfig { workers, batch_size },
            Arc::clone(&queue),
            store.clone(),
            Arc::clone(&stats),
        );
        (dir, queue, store, stats, pool)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_workers_drain_and_dedup() {
        let (_dir, queue, store, stats, pool) = setup(3, 7).await;
        assert_eq!(pool.running(), 3);

        for i in 0..50 {
            queue.enqueue(event("logs", &format!("e{}", i % 20), i));
        }
        stats.record_received(50);
        queue.wait_idle().await;

        let snap = stats.snapshot();
        assert_eq!(snap.unique_processed, 20);
        assert_eq!(snap.duplicate_dropped, 30);
        assert_eq!(snap.failed_dropped, 0);
        assert_eq!(store.total_records().await.unwrap(), 20);

        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, ShutdownReport { stopped: 3, failed: 0, aborted: 0 });
    }

    #[tokio::test]
    async fn test_idle_workers_stop_promptly() {
        let (_dir, _queue, _store, _stats, pool) = setup(4, 10).await;

        let started = Instant::now();
        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.stopped, 4);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_and_acknowledged() {
        let (_dir, queue, store, stats, pool) = setup(1, 10).await;
        store.close().await;

        queue.enqueue_all([event("logs", "a", 0), event("logs", "b", 1)]);
        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("failed batch was never acknowledged");

        let snap = stats.snapshot();
        assert_eq!(snap.failed_dropped, 2);
        assert_eq!(snap.unique_processed + snap.duplicate_dropped, 0);

        // The worker keeps running after a failure
        assert_eq!(pool.running(), 1);
        assert_eq!(pool.shutdown(Duration::from_secs(5)).await.stopped, 1);
    }

    #[tokio::test]
    async fn test_stuck_worker_is_aborted_at_deadline() {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        let (dir, queue, _store, _stats, pool) = setup(1, 10).await;

        // Hold the write lock so the worker's insert waits on busy_timeout
        let mut blocker = SqliteConnectOptions::new()
            .filename(dir.path().join("events.db"))
            .connect()
            .await
            .unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut blocker)
            .await
            .unwrap();

        queue.enqueue(event("logs", "stuck", 0));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let report = pool.shutdown(Duration::from_millis(200)).await;
        assert_eq!(report, ShutdownReport { stopped: 0, failed: 0, aborted: 1 });
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(queue.pending(), 1);

        sqlx::query("ROLLBACK").execute(&mut blocker).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_workers_still_spawns_one() {
        let (_dir, queue, _store, stats, pool) = setup(0, 0).await;
        assert_eq!(pool.running(), 1);

        queue.enqueue(event("logs", "only", 0));
        queue.wait_idle().await;
        assert_eq!(stats.snapshot().unique_processed, 1);
        pool.shutdown(Duration::from_secs(5)).await;
    }
}
