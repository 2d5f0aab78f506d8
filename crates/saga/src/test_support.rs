//! Store wrapper for exercising storage failures.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use store::{InMemoryStore, KeyValueStore, Record, Result, StoreError, Version};

/// In-memory store whose next write to a chosen record fails.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failing: Arc<Mutex<Vec<(String, String)>>>,
}

impl FlakyStore {
    /// Makes the next compare-and-set of `namespace/key` fail.
    pub fn fail_next_write(&self, namespace: &str, key: &str) {
        self.failing
            .lock()
            .unwrap()
            .push((namespace.to_string(), key.to_string()));
    }

    fn take_failure(&self, namespace: &str, key: &str) -> bool {
        let mut failing = self.failing.lock().unwrap();
        match failing
            .iter()
            .position(|(ns, k)| ns == namespace && k == key)
        {
            Some(index) => {
                failing.remove(index);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>> {
        self.inner.get(namespace, key).await
    }

    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<Version> {
        if self.take_failure(namespace, key) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner
            .compare_and_set(namespace, key, expected, value)
            .await
    }

    async fn scan(&self, namespace: &str) -> Result<Vec<Record>> {
        self.inner.scan(namespace).await
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        self.inner.remove(namespace, key).await
    }
}
