//! Synthetic load generator.
//!
//! Publishes a burst of events with a configurable share of duplicate
//! ids to a running aggregator, then polls `/stats` until every event has
//! been settled and checks the counters add up.
//!
//! Uses blocking reqwest; call it outside of an async runtime.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::errors::AggregatorError;
use crate::models::Event;

/// Default request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 5;

/// User agent string for API requests.
const USER_AGENT: &str = concat!("aggrtail-publisher/", env!("CARGO_PKG_VERSION"));

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub base_url: String,
    pub total: usize,
    /// Share of events that reuse an earlier id (0.0 to 1.0)
    pub duplicate_ratio: f64,
    pub batch_size: usize,
    pub topic: String,
    pub source: String,
    pub retries: u32,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
    /// Upper bound for both the readiness wait and the processing wait
    pub wait_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".into(),
            total: 5_000,
            duplicate_ratio: 0.2,
            batch_size: 100,
            topic: "logs".into(),
            source: "aggrtail-publisher".into(),
            retries: 3,
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(500),
            wait_timeout: Duration::from_secs(60),
        }
    }
}

/// Counters as reported by `GET /stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteStats {
    pub received: u64,
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    #[serde(default)]
    pub failed_dropped: u64,
    #[serde(default)]
    pub topics: BTreeMap<String, u64>,
}

impl RemoteStats {
    fn settled(&self) -> u64 {
        self.unique_processed + self.duplicate_dropped + self.failed_dropped
    }
}

/// Outcome of one publisher run, relative to the stats before it started.
#[derive(Debug, Clone)]
pub struct PublishReport {
    pub sent: usize,
    pub expected_unique: usize,
    pub expected_duplicates: usize,
    pub failed_batches: usize,
    pub send_elapsed: Duration,
    pub received: u64,
    pub unique_processed: u64,
    pub duplicate_dropped: u64,
    pub failed_dropped: u64,
    pub topics: BTreeMap<String, u64>,
}

impl PublishReport {
    /// Check that the aggregator's counters match what was sent.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.failed_batches == 0
            && self.failed_dropped == 0
            && self.received == self.sent as u64
            && self.unique_processed == self.expected_unique as u64
            && self.duplicate_dropped == self.expected_duplicates as u64
    }
}

/// Generate `total` events of which roughly `duplicate_ratio` reuse an earlier id.
///
/// Returns the events and the number of distinct ids among them. Duplicates
/// follow the uniques in round-robin order over the unique ids.
#[must_use]
pub fn generate_events(config: &PublisherConfig) -> (Vec<Event>, usize) {
    let ratio = config.duplicate_ratio.clamp(0.0, 1.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let mut unique = ((config.total as f64) * (1.0 - ratio)).round() as usize;
    if config.total > 0 {
        unique = unique.clamp(1, config.total);
    }

    let make = |id: &str| {
        let payload = json!({"data": "performance_test_data"});
        Event {
            topic: config.topic.clone(),
            event_id: id.to_string(),
            timestamp: Utc::now(),
            source: config.source.clone(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    };

    let ids: Vec<String> = (0..unique).map(|_| Uuid::new_v4().to_string()).collect();
    let mut events: Vec<Event> = ids.iter().map(|id| make(id)).collect();
    events.extend(
        ids.iter()
            .cycle()
            .take(config.total - unique)
            .map(|id| make(id)),
    );

    (events, unique)
}

/// Blocking HTTP client for the aggregator API.
#[derive(Debug, Clone)]
pub struct AggregatorClient {
    client: Client,
    base_url: String,
}

impl AggregatorClient {
    /// Create a new client for the aggregator at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, AggregatorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Post one batch of events.
    #[instrument(skip(self, events), fields(batch = events.len()))]
    pub fn publish(&self, events: &[Event]) -> Result<usize, AggregatorError> {
        let response = self
            .client
            .post(format!("{}/publish", self.base_url))
            .json(events)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AggregatorError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        #[derive(Deserialize)]
        struct Accepted {
            received_count: usize,
        }
        let accepted: Accepted = response.json()?;
        Ok(accepted.received_count)
    }

    /// Fetch the aggregator's counters.
    pub fn stats(&self) -> Result<RemoteStats, AggregatorError> {
        let response = self
            .client
            .get(format!("{}/stats", self.base_url))
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(AggregatorError::Api {
                status: status.as_u16(),
                message: response.text().unwrap_or_default(),
            });
        }
        Ok(response.json()?)
    }

    /// Post a batch, retrying up to `retries` times with a fixed delay.
    fn publish_with_retry(&self, events: &[Event], retries: u32, delay: Duration) -> bool {
        for attempt in 1..=retries.max(1) {
            match self.publish(events) {
                Ok(_) => return true,
                Err(e) => warn!("attempt {}: publish failed: {}", attempt, e),
            }
            thread::sleep(delay);
        }
        false
    }
}

/// Run a full publish-and-verify cycle against a live aggregator.
pub fn run(config: &PublisherConfig) -> Result<PublishReport, AggregatorError> {
    let client = AggregatorClient::new(&config.base_url)?;
    let baseline = wait_until_ready(&client, config)?;

    let (events, expected_unique) = generate_events(config);
    let expected_duplicates = events.len() - expected_unique;
    info!(
        "sending {} events ({} duplicates) to {}",
        events.len(),
        expected_duplicates,
        config.base_url
    );

    let started = Instant::now();
    let batches: Vec<&[Event]> = events.chunks(config.batch_size.max(1)).collect();
    let mut failed_batches = 0;
    let mut sent = 0;
    for (n, batch) in batches.iter().enumerate() {
        if client.publish_with_retry(batch, config.retries, config.retry_delay) {
            sent += batch.len();
            debug!("batch {}/{} sent", n + 1, batches.len());
        } else {
            failed_batches += 1;
            warn!("batch {}/{} failed after retries", n + 1, batches.len());
        }
    }
    let send_elapsed = started.elapsed();
    info!("sent {} events in {:.2}s", sent, send_elapsed.as_secs_f64());

    let target = baseline.settled() + sent as u64;
    let stats = wait_until_settled(&client, target, config)?;

    Ok(PublishReport {
        sent,
        expected_unique,
        expected_duplicates,
        failed_batches,
        send_elapsed,
        received: stats.received.saturating_sub(baseline.received),
        unique_processed: stats.unique_processed.saturating_sub(baseline.unique_processed),
        duplicate_dropped: stats.duplicate_dropped.saturating_sub(baseline.duplicate_dropped),
        failed_dropped: stats.failed_dropped.saturating_sub(baseline.failed_dropped),
        topics: stats.topics,
    })
}

fn wait_until_ready(
    client: &AggregatorClient,
    config: &PublisherConfig,
) -> Result<RemoteStats, AggregatorError> {
    let deadline = Instant::now() + config.wait_timeout;
    loop {
        match client.stats() {
            Ok(stats) => return Ok(stats),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(e) => debug!("aggregator not ready yet: {}", e),
        }
        thread::sleep(config.poll_interval);
    }
}

fn wait_until_settled(
    client: &AggregatorClient,
    target: u64,
    config: &PublisherConfig,
) -> Result<RemoteStats, AggregatorError> {
    let deadline = Instant::now() + config.wait_timeout;
    loop {
        match client.stats() {
            Ok(stats) if stats.settled() >= target => return Ok(stats),
            Ok(stats) => {
                debug!("progress: {}/{}", stats.settled(), target);
                if Instant::now() >= deadline {
                    warn!("gave up waiting for processing at {}/{}", stats.settled(), target);
                    return Ok(stats);
                }
            }
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(e) => warn!("failed to fetch stats: {}", e),
        }
        thread::sleep(config.poll_interval);
    }
}
