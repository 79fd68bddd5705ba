//! Unbounded in-memory hand-off queue between ingress and workers.
//!
//! Producers never wait. Workers wait only for the first item of a
//! batch, then take whatever else is already buffered. Every drained
//! item must later be acknowledged with [`IngestQueue::ack`] so that
//! [`IngestQueue::wait_idle`] can tell when the pipeline has settled.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::warn;

use crate::models::Event;

/// FIFO event buffer shared by all producers and workers.
#[derive(Debug)]
pub struct IngestQueue {
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<mpsc::UnboundedReceiver<Event>>,
    /// Enqueued but not yet acknowledged
    pending: AtomicU64,
    idle: Notify,
}

impl IngestQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    /// Append one event. Never blocks.
    pub fn enqueue(&self, event: Event) {
        // Counted before send
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(event).is_err() {
            warn!("ingest queue receiver dropped, event discarded");
            self.ack(1);
        }
    }

    /// Append events in order. Never blocks.
    pub fn enqueue_all(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.enqueue(event);
        }
    }

    /// Wait for at least one event, then drain up to `max_size` without waiting again.
    ///
    /// Cancel safe: dropping the future while it waits leaves every buffered
    /// event in the queue. A `max_size` of zero is treated as one.
    pub async fn dequeue_batch(&self, max_size: usize) -> Vec<Event> {
        let max_size = max_size.max(1);
        let mut rx = self.rx.lock().await;

        let Some(first) = rx.recv().await else {
            return Vec::new();
        };

        let mut batch = Vec::with_capacity(max_size.min(64));
        batch.push(first);
        while batch.len() < max_size {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }
        batch
    }

    /// Acknowledge `count` drained events as finished.
    pub fn ack(&self, count: usize) {
        let count = count as u64;
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(p.saturating_sub(count))
            })
            .unwrap_or_default();

        if previous <= count {
            self.idle.notify_waiters();
        }
    }

    /// Events enqueued but not yet acknowledged.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Check if nothing is waiting or in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until every enqueued event has been acknowledged.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent ack cannot slip between.
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for IngestQueue {
    fn default() -> Self {
        Self::new()
    }
}
