//! Typed access to a single namespace.

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

use crate::{KeyValueStore, Result, StoreExt, Version};

/// A typed view over one namespace of a [`KeyValueStore`].
///
/// Repositories are cheap to clone when the underlying store is.
pub struct Repository<S, T> {
    store: S,
    namespace: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<S: Clone, T> Clone for Repository<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            namespace: self.namespace,
            _marker: PhantomData,
        }
    }
}

impl<S, T> Repository<S, T>
where
    S: KeyValueStore,
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Creates a repository for the given namespace.
    pub fn new(store: S, namespace: &'static str) -> Self {
        Self {
            store,
            namespace,
            _marker: PhantomData,
        }
    }

    /// Returns the namespace this repository reads and writes.
    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads a value and the version it was read at.
    pub async fn load(&self, key: &str) -> Result<Option<(T, Version)>> {
        self.store.get_typed(self.namespace, key).await
    }

    /// Saves a value if the stored version still equals `expected`.
    pub async fn save(&self, key: &str, expected: Version, value: &T) -> Result<Version> {
        self.store
            .put_typed(self.namespace, key, expected, value)
            .await
    }

    /// Inserts a value only if the key is absent.
    pub async fn insert_if_absent(&self, key: &str, value: &T) -> Result<bool> {
        self.store
            .insert_if_absent(self.namespace, key, value)
            .await
    }

    /// Loads every value in the namespace, in key order.
    pub async fn list(&self) -> Result<Vec<(String, T)>> {
        let records = self.store.scan(self.namespace).await?;
        let mut values = Vec::with_capacity(records.len());
        for record in records {
            let value = record.decode()?;
            values.push((record.key, value));
        }
        Ok(values)
    }

    /// Removes a value.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.store.remove(self.namespace, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct StockLevel {
        available: u32,
    }

    #[tokio::test]
    async fn test_typed_roundtrip_and_cas() {
        let repo: Repository<InMemoryStore, StockLevel> =
            Repository::new(InMemoryStore::new(), "stock");

        let v1 = repo
            .save("A", Version::initial(), &StockLevel { available: 5 })
            .await
            .unwrap();
        let (level, version) = repo.load("A").await.unwrap().unwrap();
        assert_eq!(level.available, 5);
        assert_eq!(version, v1);

        repo.save("A", version, &StockLevel { available: 3 })
            .await
            .unwrap();
        let stale = repo.save("A", version, &StockLevel { available: 1 }).await;
        assert!(stale.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_list_and_remove() {
        let repo: Repository<InMemoryStore, StockLevel> =
            Repository::new(InMemoryStore::new(), "stock");
        assert!(
            repo.insert_if_absent("B", &StockLevel { available: 2 })
                .await
                .unwrap()
        );
        assert!(
            !repo
                .insert_if_absent("B", &StockLevel { available: 9 })
                .await
                .unwrap()
        );
        repo.insert_if_absent("A", &StockLevel { available: 1 })
            .await
            .unwrap();

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "A");
        assert_eq!(all[1].1, StockLevel { available: 2 });

        assert!(repo.remove("A").await.unwrap());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }
}
