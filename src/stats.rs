//! Process-wide ingestion counters.
//!
//! Every counter lives behind one short-lived lock so a snapshot never
//! mixes values from before and after a batch was recorded.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    received: u64,
    unique_processed: u64,
    duplicate_dropped: u64,
    failed_dropped: u64,
}

/// Shared statistics tracker, passed by `Arc` into every worker.
#[derive(Debug)]
pub struct StatsTracker {
    counters: Mutex<Counters>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl StatsTracker {
    /// Create a tracker whose uptime starts now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        // Counters are plain integers, a poisoned guard is still valid.
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record events accepted at ingress.
    pub fn record_received(&self, count: u64) {
        let mut c = self.lock();
        c.received = c.received.saturating_add(count);
    }

    /// Record the outcome of one committed batch.
    pub fn record_batch(&self, unique: u64, duplicates: u64) {
        let mut c = self.lock();
        c.unique_processed = c.unique_processed.saturating_add(unique);
        c.duplicate_dropped = c.duplicate_dropped.saturating_add(duplicates);
    }

    /// Record events lost because their batch failed to persist.
    pub fn record_failed(&self, count: u64) {
        let mut c = self.lock();
        c.failed_dropped = c.failed_dropped.saturating_add(count);
    }

    /// Take a consistent snapshot with derived metrics.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = *self.lock();
        StatsSnapshot::from_counters(counters, self.started_at, self.started.elapsed())
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    pub failed_dropped: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    /// Unique events persisted per second of uptime
    pub throughput: f64,
    /// Share of received events that were duplicates (0.0 to 1.0)
    pub duplicate_rate: f64,
}

impl StatsSnapshot {
    #[allow(clippy::cast_precision_loss)]
    fn from_counters(c: Counters, started_at: DateTime<Utc>, uptime: Duration) -> Self {
        let uptime_seconds = uptime.as_secs_f64();
        let throughput = if uptime_seconds > 0.0 {
            c.unique_processed as f64 / uptime_seconds
        } else {
            0.0
        };
        let duplicate_rate = if c.received == 0 {
            0.0
        } else {
            (c.duplicate_dropped as f64 / c.received as f64).max(0.0)
        };

        Self {
            received: c.received,
            unique_processed: c.unique_processed,
            duplicate_dropped: c.duplicate_dropped,
            failed_dropped: c.failed_dropped,
            started_at,
            uptime_seconds,
            throughput,
            duplicate_rate,
        }
    }

    /// Events with a terminal outcome so far.
    #[must_use]
    pub fn settled(&self) -> u64 {
        self.unique_processed + self.duplicate_dropped + self.failed_dropped
    }
}
