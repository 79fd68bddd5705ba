//! Pipeline lifecycle: store, queue, counters and workers wired together.
//!
//! `Aggregator::start` opens the store first; if that fails nothing is
//! spawned. `shutdown` stops the workers and closes the store.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use crate::errors::AggregatorError;
use crate::models::Event;
use crate::query::QueryService;
use crate::queue::IngestQueue;
use crate::stats::{StatsSnapshot, StatsTracker};
use crate::store::DedupStore;
use crate::worker::{ShutdownReport, WorkerConfig, WorkerPool};

/// Default database location.
pub const DEFAULT_DB_PATH: &str = "data/aggregator.db";

/// Default bound on how long shutdown waits for workers.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Connections kept for read paths on top of one per worker.
const READ_CONNECTIONS: u32 = 4;

/// Everything the pipeline needs to start.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub db_path: PathBuf,
    pub workers: WorkerConfig,
    pub shutdown_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            workers: WorkerConfig::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// A running ingestion pipeline.
#[derive(Debug)]
pub struct Aggregator {
    queue: Arc<IngestQueue>,
    stats: Arc<StatsTracker>,
    store: DedupStore,
    pool: Mutex<Option<WorkerPool>>,
    shutdown_timeout: Duration,
}

impl Aggregator {
    /// Open the store and start the workers.
    pub async fn start(config: AggregatorConfig) -> Result<Self, AggregatorError> {
        let workers = u32::try_from(config.workers.workers).unwrap_or(u32::MAX);
        let store =
            DedupStore::open_with(&config.db_path, workers.saturating_add(READ_CONNECTIONS)).await?;

        let existing = store.total_records().await?;

        let queue = Arc::new(IngestQueue::new());
        let stats = Arc::new(StatsTracker::new());
        let pool = WorkerPool::spawn(
            config.workers,
            Arc::clone(&queue),
            store.clone(),
            Arc::clone(&stats),
        );

        info!(
            db = %config.db_path.display(),
            workers = pool.running(),
            existing,
            "aggregator started"
        );

        Ok(Self {
            queue,
            stats,
            store,
            pool: Mutex::new(Some(pool)),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Validate and enqueue events. Returns how many were accepted.
    ///
    /// All-or-nothing: if any event is invalid, none are enqueued.
    pub fn publish(&self, events: Vec<Event>) -> Result<usize, AggregatorError> {
        for event in &events {
            event.validate()?;
        }

        let count = events.len();
        // Counted before enqueue
        self.stats.record_received(count as u64);
        self.queue.enqueue_all(events);
        Ok(count)
    }

    /// Wait until every published event has reached a terminal outcome.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Events published but not yet settled.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.queue.pending()
    }

    /// Read-only view of the stored events.
    #[must_use]
    pub fn query(&self) -> QueryService {
        QueryService::new(self.store.clone())
    }

    /// Stop the workers, then close the store.
    ///
    /// Events still queued are abandoned. Calling this twice is harmless.
    pub async fn shutdown(&self) -> ShutdownReport {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(pool) = pool else {
            return ShutdownReport::default();
        };

        let report = pool.shutdown(self.shutdown_timeout).await;
        let abandoned = self.queue.pending();
        if abandoned > 0 {
            warn!(abandoned, "events left unprocessed at shutdown");
        }

        self.store.close().await;
        let stats = self.stats.snapshot();
        info!(
            received = stats.received,
            settled = stats.settled(),
            "aggregator shutdown complete"
        );
        report
    }
}
