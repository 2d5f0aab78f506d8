//! Idempotency store.
//!
//! Services consult the store before applying any side effect: the first
//! caller for a key gets [`IdempotencyCheck::Fresh`] and applies the effect,
//! every later caller gets [`IdempotencyCheck::Duplicate`] and replays the
//! outcome that was recorded for the key.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use store::{KeyValueStore, Repository, Result};

const NAMESPACE: &str = "idempotency";

/// Result of [`IdempotencyStore::check_and_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// First time the key is seen. The caller owns the effect.
    Fresh,
    /// The key was recorded before. The effect must not be applied again.
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdempotencyRecord {
    first_seen_at: DateTime<Utc>,
    #[serde(default)]
    outcome: Option<serde_json::Value>,
}

/// Store-backed idempotency keys with recorded outcomes.
pub struct IdempotencyStore<S> {
    records: Repository<S, IdempotencyRecord>,
    retention: Duration,
}

impl<S: Clone> Clone for IdempotencyStore<S> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            retention: self.retention,
        }
    }
}

impl<S: KeyValueStore> IdempotencyStore<S> {
    /// Creates an idempotency store keeping keys for at least `retention`.
    ///
    /// The retention must exceed the longest span over which a message can
    /// be redelivered or retried.
    pub fn new(store: S, retention: Duration) -> Self {
        Self {
            records: Repository::new(store, NAMESPACE),
            retention,
        }
    }

    /// Returns the retention window.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Atomically records `key`, reporting whether it was already present.
    pub async fn check_and_record(&self, key: &str) -> Result<IdempotencyCheck> {
        let record = IdempotencyRecord {
            first_seen_at: Utc::now(),
            outcome: None,
        };

        if self.records.insert_if_absent(key, &record).await? {
            Ok(IdempotencyCheck::Fresh)
        } else {
            tracing::debug!(%key, "duplicate idempotency key");
            metrics::counter!("idempotency_duplicates_total").increment(1);
            Ok(IdempotencyCheck::Duplicate)
        }
    }

    /// Stores the outcome of the effect applied for `key`.
    pub async fn record_outcome<T: Serialize>(&self, key: &str, outcome: &T) -> Result<()> {
        let outcome = serde_json::to_value(outcome)?;
        let (mut record, version) = match self.records.load(key).await? {
            Some(found) => found,
            None => (
                IdempotencyRecord {
                    first_seen_at: Utc::now(),
                    outcome: None,
                },
                store::Version::initial(),
            ),
        };
        record.outcome = Some(outcome);
        self.records.save(key, version, &record).await?;
        Ok(())
    }

    /// Returns the outcome recorded for `key`, if any.
    pub async fn outcome<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let outcome = self
            .records
            .load(key)
            .await?
            .and_then(|(record, _)| record.outcome);

        match outcome {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Removes keys first seen more than the retention window before `now`.
    ///
    /// Returns the number of keys removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention =
            chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let mut removed = 0;

        for (key, record) in self.records.list().await? {
            let expired = record
                .first_seen_at
                .checked_add_signed(retention)
                .is_some_and(|expires_at| expires_at < now);
            if expired && self.records.remove(&key).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "purged expired idempotency keys");
        }
        Ok(removed)
    }
}
