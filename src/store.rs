//! Durable deduplicating event store.
//!
//! SQLite through sqlx, with WAL journaling and `synchronous = NORMAL`:
//! a crash may lose the most recent commit but never corrupts the file.
//!
//! Uniqueness is enforced solely by the `(topic, event_id)` primary key
//! and `INSERT ... ON CONFLICT DO NOTHING`. The number of newly stored
//! events is taken from the engine's affected-row counts inside the
//! committed transaction, never from a separate existence check.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use crate::errors::AggregatorError;
use crate::models::{parse_storage_timestamp, storage_timestamp, Event, StoredRecord};

/// Default maximum connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Default connection acquire timeout.
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a writer waits on a locked database before failing the batch.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_TABLE_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS processed_events (
        topic        TEXT NOT NULL,
        event_id     TEXT NOT NULL,
        timestamp    TEXT NOT NULL,
        source       TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        PRIMARY KEY (topic, event_id)
    )
";

const CREATE_TOPIC_INDEX_SQL: &str = r"
    CREATE INDEX IF NOT EXISTS idx_processed_events_topic_ts
        ON processed_events (topic, timestamp)
";

const INSERT_SQL: &str = r"
    INSERT INTO processed_events (topic, event_id, timestamp, source, payload_json)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT (topic, event_id) DO NOTHING
";

/// Row layout of `processed_events`.
type EventRow = (String, String, String, String, String);

/// Durable keyed store with an atomic batched conditional insert.
///
/// Cloning is cheap; clones share one connection pool, and every
/// `batch_upsert` runs on its own pooled connection.
#[derive(Clone)]
pub struct DedupStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl std::fmt::Debug for DedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DedupStore {
    /// Open (or create) the store at `path` with the default pool size.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AggregatorError> {
        Self::open_with(path, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open (or create) the store with an explicit connection limit.
    ///
    /// Creates missing parent directories and the schema. Any failure here
    /// means the aggregator must not start consuming.
    pub async fn open_with(
        path: impl AsRef<Path>,
        max_connections: u32,
    ) -> Result<Self, AggregatorError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        sqlx::query(CREATE_TOPIC_INDEX_SQL).execute(&pool).await?;

        info!(path = %path.display(), "event store ready");
        Ok(Self { pool, path })
    }

    /// Insert a batch of events in one transaction, skipping known keys.
    ///
    /// Returns how many rows were actually inserted. Duplicates inside the
    /// batch itself, or against rows committed by any other writer, count
    /// as zero. On error the whole transaction is rolled back.
    pub async fn batch_upsert(&self, events: &[Event]) -> Result<u64, AggregatorError> {
        if events.is_empty() {
            return Ok(0);
        }

        // Encode before taking the write lock.
        let rows = events
            .iter()
            .map(|e| -> Result<_, AggregatorError> {
                Ok((
                    e,
                    storage_timestamp(&e.timestamp),
                    serde_json::to_string(&e.payload)?,
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for (event, timestamp, payload) in &rows {
            let result = sqlx::query(INSERT_SQL)
                .bind(&event.topic)
                .bind(&event.event_id)
                .bind(timestamp)
                .bind(&event.source)
                .bind(payload)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;

        debug!(batch = events.len(), inserted, "batch committed");
        Ok(inserted)
    }

    /// All stored records for a topic, oldest first.
    pub async fn list_by_topic(&self, topic: &str) -> Result<Vec<StoredRecord>, AggregatorError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT topic, event_id, timestamp, source, payload_json
             FROM processed_events
             WHERE topic = ?1
             ORDER BY timestamp, event_id",
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Number of stored records per topic.
    pub async fn counts_by_topic(&self) -> Result<BTreeMap<String, u64>, AggregatorError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT topic, COUNT(*) FROM processed_events GROUP BY topic ORDER BY topic",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(topic, count)| (topic, u64::try_from(count).unwrap_or_default()))
            .collect())
    }

    /// Total number of stored records across all topics.
    pub async fn total_records(&self) -> Result<u64, AggregatorError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_record(
    (topic, event_id, timestamp, source, payload_json): EventRow,
) -> Result<StoredRecord, AggregatorError> {
    Ok(StoredRecord {
        timestamp: parse_storage_timestamp(&timestamp)?,
        payload: serde_json::from_str(&payload_json)?,
        topic,
        event_id,
        source,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    /// Build a test event with a fixed timestamp offset (seconds).
    pub(crate) fn event(topic: &str, id: &str, secs: i64) -> Event {
        let payload = json!({"message": format!("event {id}")});
        Event {
            topic: topic.into(),
            event_id: id.into(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            source: "test_publisher".into(),
            payload: payload.as_object().unwrap().clone(),
        }
    }

    #[tokio::test]
    async fn test_batch_upsert_counts_new_rows() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();

        let batch = vec![event("logs", "e1", 0), event("logs", "e2", 1)];
        assert_eq!(store.batch_upsert(&batch).await.unwrap(), 2);

        // Same keys again plus one new one
        let batch = vec![
            event("logs", "e1", 0),
            event("logs", "e2", 1),
            event("logs", "e3", 2),
        ];
        assert_eq!(store.batch_upsert(&batch).await.unwrap(), 1);
        assert_eq!(store.total_records().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_duplicates_inside_one_batch() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();

        let batch = vec![event("logs", "e1", 0), event("logs", "e1", 0)];
        assert_eq!(store.batch_upsert(&batch).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();
        assert_eq!(store.batch_upsert(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();

        let first = event("logs", "e1", 0);
        let mut second = event("logs", "e1", 5);
        second
            .payload
            .insert("message".into(), json!("rewritten"));
        second.source = "other".into();

        store.batch_upsert(&[first.clone()]).await.unwrap();
        assert_eq!(store.batch_upsert(&[second]).await.unwrap(), 0);

        let records = store.list_by_topic("logs").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, first.payload);
        assert_eq!(records[0].source, first.source);
        assert_eq!(records[0].timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn test_same_id_on_different_topics() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();

        let batch = vec![event("topic-b", "e-20", 0), event("topic-c", "e-20", 0)];
        assert_eq!(store.batch_upsert(&batch).await.unwrap(), 2);

        let counts = store.counts_by_topic().await.unwrap();
        assert_eq!(counts.get("topic-b"), Some(&1));
        assert_eq!(counts.get("topic-c"), Some(&1));
    }

    #[tokio::test]
    async fn test_list_by_topic_orders_by_timestamp() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();

        let batch = vec![
            event("logs", "late", 30),
            event("logs", "early", 10),
            event("metrics", "other", 0),
            event("logs", "middle", 20),
        ];
        store.batch_upsert(&batch).await.unwrap();

        let ids: Vec<_> = store
            .list_by_topic("logs")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.event_id)
            .collect();
        assert_eq!(ids, ["early", "middle", "late"]);
        assert!(store.list_by_topic("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();

        let mut sent = event("logs", "rt", 0);
        sent.payload.insert(
            "nested".into(),
            json!({"list": [1, 2.5, "three", null], "flag": true}),
        );
        store.batch_upsert(&[sent.clone()]).await.unwrap();

        let record = store.list_by_topic("logs").await.unwrap().remove(0);
        assert_eq!(record.topic, sent.topic);
        assert_eq!(record.event_id, sent.event_id);
        assert_eq!(record.source, sent.source);
        assert_eq!(record.payload, sent.payload);
        assert_eq!(record.timestamp, sent.timestamp);
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.db");

        let store = DedupStore::open(&path).await.unwrap();
        store.batch_upsert(&[event("logs", "e1", 0)]).await.unwrap();
        store.close().await;
        assert!(store.total_records().await.is_err());

        let reopened = DedupStore::open(&path).await.unwrap();
        assert_eq!(reopened.batch_upsert(&[event("logs", "e1", 0)]).await.unwrap(), 0);
        assert_eq!(reopened.total_records().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_race_on_same_key() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let batch = vec![event("logs", "contended", i), event("logs", &format!("own-{i}"), i)];
                store.batch_upsert(&batch).await.unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            inserted += handle.await.unwrap();
        }

        // One winner for the shared key plus one row per writer
        assert_eq!(inserted, 9);
        assert_eq!(store.total_records().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_open_fails_when_directory_cannot_exist() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let result = DedupStore::open(blocker.join("events.db")).await;
        assert!(result.is_err());
    }
}
