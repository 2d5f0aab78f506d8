use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Record, Result, StoreError, Version};

/// Core trait for key/value store implementations.
///
/// A store keeps versioned JSON records addressed by `(namespace, key)`.
/// All implementations must be thread-safe (Send + Sync) and every write must
/// be an atomic compare-and-set against the record's current version.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Retrieves a record by key.
    ///
    /// Returns None if no record exists.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>>;

    /// Writes a record if its current version equals `expected`.
    ///
    /// `Version::initial()` means the record must not exist yet. On success
    /// the new version is returned; on mismatch the call fails with
    /// `ConcurrencyConflict` and nothing is written.
    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<Version>;

    /// Returns all records in a namespace ordered by key.
    async fn scan(&self, namespace: &str) -> Result<Vec<Record>>;

    /// Removes a record. Returns true if a record was removed.
    async fn remove(&self, namespace: &str, key: &str) -> Result<bool>;
}

/// Extension trait providing typed convenience methods for stores.
#[async_trait]
pub trait StoreExt: KeyValueStore {
    /// Loads and decodes a record, returning the value and its version.
    async fn get_typed<T>(&self, namespace: &str, key: &str) -> Result<Option<(T, Version)>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(namespace, key).await? {
            Some(record) => Ok(Some((record.decode()?, record.version))),
            None => Ok(None),
        }
    }

    /// Encodes and writes a value with a compare-and-set.
    async fn put_typed<T>(
        &self,
        namespace: &str,
        key: &str,
        expected: Version,
        value: &T,
    ) -> Result<Version>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(value)?;
        self.compare_and_set(namespace, key, expected, value).await
    }

    /// Inserts a record only if the key is absent.
    ///
    /// Returns true if this call created the record, false if it already
    /// existed. The check and the insert are a single atomic operation.
    async fn insert_if_absent<T>(&self, namespace: &str, key: &str, value: &T) -> Result<bool>
    where
        T: Serialize + Sync,
    {
        match self
            .put_typed(namespace, key, Version::initial(), value)
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::ConcurrencyConflict { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>> {
        (**self).get(namespace, key).await
    }

    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<Version> {
        (**self)
            .compare_and_set(namespace, key, expected, value)
            .await
    }

    async fn scan(&self, namespace: &str) -> Result<Vec<Record>> {
        (**self).scan(namespace).await
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        (**self).remove(namespace, key).await
    }
}

// Blanket implementation for all KeyValueStore implementations
impl<T: KeyValueStore + ?Sized> StoreExt for T {}
