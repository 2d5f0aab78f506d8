//! Durable delay queue and the scheduler that drains it.
//!
//! Retries and response deadlines are not timers inside a worker: they are
//! entries in a store-backed queue keyed by due time. A separate
//! [`RetryScheduler`] task republishes due entries to the bus, so a crashed
//! worker never loses a pending retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use store::{KeyValueStore, Repository};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{Envelope, EventBus, Result};

const NAMESPACE: &str = "delay_queue";

/// A message waiting for its due time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedMessage {
    /// Earliest time the message may be published.
    pub due_at: DateTime<Utc>,
    /// Topic to publish to.
    pub topic: String,
    /// The message itself.
    pub envelope: Envelope,
}

/// Durable queue of messages keyed by due time.
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// Stores a message to be published at `due_at`.
    async fn schedule(&self, due_at: DateTime<Utc>, topic: &str, envelope: Envelope) -> Result<()>;

    /// Returns entries due at or before `now`, in due order, with their keys.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<(String, DelayedMessage)>>;

    /// Removes an entry once it has been published.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Returns the number of waiting entries.
    async fn len(&self) -> Result<usize>;
}

/// Delay queue backed by a [`KeyValueStore`].
///
/// Keys are `"{due_millis:020}:{message_id}"`, so a key scan is a scan in
/// due-time order.
pub struct StoreDelayQueue<S> {
    entries: Repository<S, DelayedMessage>,
}

impl<S: KeyValueStore> StoreDelayQueue<S> {
    /// Creates a queue over the given store.
    pub fn new(store: S) -> Self {
        Self {
            entries: Repository::new(store, NAMESPACE),
        }
    }

    fn key_for(due_at: DateTime<Utc>, envelope: &Envelope) -> String {
        let millis = due_at.timestamp_millis().max(0);
        format!("{millis:020}:{}", envelope.id)
    }
}

#[async_trait]
impl<S: KeyValueStore> DelayQueue for StoreDelayQueue<S> {
    async fn schedule(&self, due_at: DateTime<Utc>, topic: &str, envelope: Envelope) -> Result<()> {
        let key = Self::key_for(due_at, &envelope);
        let message_type = envelope.message_type.clone();
        let order_id = envelope.correlation_id.clone();

        let entry = DelayedMessage {
            due_at,
            topic: topic.to_string(),
            envelope,
        };
        if self.entries.insert_if_absent(&key, &entry).await? {
            tracing::debug!(%key, %message_type, %order_id, "message scheduled");
        } else {
            // Same envelope, same due time: an outbox flushed twice.
            tracing::debug!(%key, %message_type, %order_id, "message already scheduled");
        }
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<(String, DelayedMessage)>> {
        Ok(self
            .entries
            .list()
            .await?
            .into_iter()
            .filter(|(_, entry)| entry.due_at <= now)
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key).await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.list().await?.len())
    }
}

/// Timer-driven producer that moves due entries from a [`DelayQueue`] to
/// the bus.
///
/// An entry is removed only after its publish succeeded; a failed publish
/// leaves it in place for the next tick.
pub struct RetryScheduler {
    queue: Arc<dyn DelayQueue>,
    bus: Arc<dyn EventBus>,
    tick: Duration,
}

impl RetryScheduler {
    /// Creates a scheduler polling every `tick`.
    pub fn new(queue: Arc<dyn DelayQueue>, bus: Arc<dyn EventBus>, tick: Duration) -> Self {
        Self { queue, bus, tick }
    }

    /// Publishes every entry due at `now`. Returns how many were published.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut published = 0;

        for (key, entry) in self.queue.due(now).await? {
            match self.bus.publish(&entry.topic, entry.envelope).await {
                Ok(()) => {
                    self.queue.remove(&key).await?;
                    published += 1;
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "publishing due message failed, will retry");
                    metrics::counter!("scheduler_publish_failures_total").increment(1);
                }
            }
        }

        if published > 0 {
            metrics::counter!("scheduler_messages_released_total").increment(published as u64);
        }
        Ok(published)
    }

    /// Starts the scheduler on the current runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(tick_ms = self.tick.as_millis() as u64, "retry scheduler started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            tracing::error!(error = %e, "retry scheduler tick failed");
                        }
                    }
                }
            }

            tracing::info!("retry scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Handle to a running [`RetryScheduler`].
pub struct SchedulerHandle {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the scheduler and waits for the current tick to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "retry scheduler task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BusConfig, InMemoryEventBus, Message, StoreDeadLetterSink};
    use store::InMemoryStore;

    fn setup() -> (Arc<StoreDelayQueue<InMemoryStore>>, InMemoryEventBus) {
        let store = InMemoryStore::new();
        let sink = Arc::new(StoreDeadLetterSink::new(store.clone()));
        let bus = InMemoryEventBus::new(BusConfig::default(), sink);
        (Arc::new(StoreDelayQueue::new(store)), bus)
    }

    #[tokio::test]
    async fn test_due_returns_entries_in_due_order() {
        let (queue, _) = setup();
        let now = Utc::now();

        let late = Envelope::new("O1", Message::CancelOrder);
        let early = Envelope::new("O2", Message::StartSaga);
        queue
            .schedule(now + chrono::Duration::seconds(2), "t", late)
            .await
            .unwrap();
        queue
            .schedule(now + chrono::Duration::seconds(1), "t", early.clone())
            .await
            .unwrap();

        assert!(queue.due(now).await.unwrap().is_empty());

        let due = queue
            .due(now + chrono::Duration::milliseconds(1500))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.envelope, early);

        let all = queue.due(now + chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].1.envelope.id, early.id);
    }

    #[tokio::test]
    async fn test_rescheduling_same_envelope_keeps_one_entry() {
        let (queue, _) = setup();
        let due_at = Utc::now();
        let envelope = Envelope::new("O1", Message::StartSaga);

        queue.schedule(due_at, "t", envelope.clone()).await.unwrap();
        queue.schedule(due_at, "t", envelope).await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_once_publishes_and_removes() {
        let (queue, bus) = setup();
        let now = Utc::now();
        queue
            .schedule(now, "orders.saga", Envelope::new("O1", Message::StartSaga))
            .await
            .unwrap();

        let scheduler = RetryScheduler::new(
            queue.clone(),
            Arc::new(bus.clone()),
            Duration::from_millis(10),
        );
        assert_eq!(scheduler.run_once(now).await.unwrap(), 1);
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(bus.published("orders.saga").await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_entry() {
        let (queue, bus) = setup();
        let now = Utc::now();
        queue
            .schedule(now, "orders.saga", Envelope::new("O1", Message::StartSaga))
            .await
            .unwrap();

        bus.fail_next_publishes(1);
        let scheduler = RetryScheduler::new(
            queue.clone(),
            Arc::new(bus.clone()),
            Duration::from_millis(10),
        );

        assert_eq!(scheduler.run_once(now).await.unwrap(), 0);
        assert_eq!(queue.len().await.unwrap(), 1);

        assert_eq!(scheduler.run_once(now).await.unwrap(), 1);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_scheduler_releases_due_entries() {
        let (queue, bus) = setup();
        queue
            .schedule(
                Utc::now() + chrono::Duration::milliseconds(30),
                "orders.saga",
                Envelope::new("O1", Message::StartSaga),
            )
            .await
            .unwrap();

        let handle = RetryScheduler::new(
            queue.clone(),
            Arc::new(bus.clone()),
            Duration::from_millis(10),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop().await;

        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(bus.published("orders.saga").await.len(), 1);
    }
}
