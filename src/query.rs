//! Read-only access to stored events.
//!
//! No caching: every call goes to the store, so results are as fresh as
//! the last committed batch and never include events still queued.

use std::collections::BTreeMap;

use crate::errors::AggregatorError;
use crate::models::StoredRecord;
use crate::store::DedupStore;

/// Query facade handed to reporting layers.
#[derive(Debug, Clone)]
pub struct QueryService {
    store: DedupStore,
}

impl QueryService {
    #[must_use]
    pub fn new(store: DedupStore) -> Self {
        Self { store }
    }

    /// Stored records for `topic`, oldest first.
    pub async fn list_by_topic(&self, topic: &str) -> Result<Vec<StoredRecord>, AggregatorError> {
        self.store.list_by_topic(topic).await
    }

    /// Stored record count per topic.
    pub async fn counts_by_topic(&self) -> Result<BTreeMap<String, u64>, AggregatorError> {
        self.store.counts_by_topic().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::event;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_reads_reflect_latest_commit() {
        let dir = tempdir().unwrap();
        let store = DedupStore::open(dir.path().join("events.db")).await.unwrap();
        let query = QueryService::new(store.clone());

        assert!(query.counts_by_topic().await.unwrap().is_empty());

        store.batch_upsert(&[event("logs", "e1", 0)]).await.unwrap();
        assert_eq!(query.list_by_topic("logs").await.unwrap().len(), 1);

        store.batch_upsert(&[event("logs", "e2", 1)]).await.unwrap();
        assert_eq!(query.counts_by_topic().await.unwrap().get("logs"), Some(&2));
    }
}
