use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{KeyValueStore, Record, Result, StoreError, Version};

/// In-memory store implementation.
///
/// Provides the same interface and concurrency semantics as the PostgreSQL
/// implementation. Cloning shares the underlying data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<BTreeMap<(String, String), Record>>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of records stored.
    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns the number of records in a namespace.
    pub async fn namespace_count(&self, namespace: &str) -> usize {
        self.records
            .read()
            .await
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    /// Clears all records.
    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>> {
        let records = self.records.read().await;
        Ok(records
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<Version> {
        let mut records = self.records.write().await;
        let id = (namespace.to_string(), key.to_string());

        let actual = records
            .get(&id)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        if actual != expected {
            return Err(StoreError::ConcurrencyConflict {
                namespace: namespace.to_string(),
                key: key.to_string(),
                expected,
                actual,
            });
        }

        let version = actual.next();
        records.insert(
            id,
            Record {
                namespace: namespace.to_string(),
                key: key.to_string(),
                version,
                value,
                updated_at: Utc::now(),
            },
        );

        Ok(version)
    }

    async fn scan(&self, namespace: &str) -> Result<Vec<Record>> {
        let records = self.records.read().await;
        // BTreeMap keeps (namespace, key) sorted, so this is already key order
        Ok(records
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        Ok(records
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }
}
