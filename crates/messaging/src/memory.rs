//! In-memory event bus.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::{
    AttemptRecord, DeadLetter, DeadLetterSink, Envelope, EventBus, HandlerError, MessageHandler,
    PartitionKeyFn, Result, TransportError,
};

/// Configuration for [`InMemoryEventBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Worker tasks per subscription. Each partition key maps to one worker.
    pub partition_workers: usize,
    /// How long a handler may take before the delivery counts as lost.
    pub ack_deadline: Duration,
    /// Deliveries of one message before it is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            partition_workers: 4,
            ack_deadline: Duration::from_secs(5),
            max_deliveries: 5,
        }
    }
}

struct Subscription {
    partition_key: PartitionKeyFn,
    shards: Vec<mpsc::UnboundedSender<Envelope>>,
}

impl Subscription {
    fn dispatch(&self, envelope: Envelope) -> bool {
        let key = (self.partition_key)(&envelope);
        let shard = shard_for(&key, self.shards.len());
        self.shards[shard].send(envelope).is_ok()
    }
}

fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

#[derive(Default)]
struct Topic {
    subscriptions: Vec<Subscription>,
    /// Messages published before anyone subscribed.
    backlog: Vec<Envelope>,
}

struct Inner {
    config: BusConfig,
    topics: RwLock<HashMap<String, Topic>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    published: RwLock<Vec<(String, Envelope)>>,
    failing_publishes: AtomicU32,
    pending: AtomicUsize,
    idle: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Inner {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Event bus running entirely inside the process.
///
/// Each subscription owns a fixed pool of worker tasks fed by unbounded
/// channels. A message goes to the worker chosen by hashing its partition
/// key, so one key is always handled by one worker, in order. Failed
/// deliveries are retried in place by that worker until the delivery
/// budget runs out, then the message is dead-lettered.
///
/// Cloning shares the same bus.
#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

impl InMemoryEventBus {
    /// Creates a bus that dead-letters into `dead_letters`.
    pub fn new(config: BusConfig, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        tracing::info!(
            partition_workers = config.partition_workers,
            ack_deadline_ms = config.ack_deadline.as_millis() as u64,
            max_deliveries = config.max_deliveries,
            "in-memory event bus initialized"
        );

        Self {
            inner: Arc::new(Inner {
                config,
                topics: RwLock::new(HashMap::new()),
                dead_letters,
                published: RwLock::new(Vec::new()),
                failing_publishes: AtomicU32::new(0),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                workers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Makes the next `count` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Returns every envelope successfully published to `topic`, in order.
    pub async fn published(&self, topic: &str) -> Vec<Envelope> {
        self.inner
            .published
            .read()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    /// Returns the total number of successful publishes on all topics.
    pub async fn published_count(&self) -> usize {
        self.inner.published.read().await.len()
    }

    /// Returns the number of messages waiting for a subscriber on `topic`.
    pub async fn backlog_len(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .await
            .get(topic)
            .map_or(0, |t| t.backlog.len())
    }

    /// Returns the number of dispatched messages not yet fully handled.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Waits until every dispatched message has been handled.
    ///
    /// Messages still sitting in a delay queue are not counted.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting messages and waits for queued deliveries to finish.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the senders lets each worker drain its queue and exit.
        self.inner.topics.write().await.clear();

        let workers = std::mem::take(&mut *self.inner.workers.lock().await);
        let count = workers.len();
        for result in futures_util::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "bus worker panicked");
            }
        }
        tracing::info!(workers = count, "event bus shut down");
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    #[tracing::instrument(
        name = "bus.publish",
        skip(self, envelope),
        fields(message_type = %envelope.message_type, order_id = %envelope.correlation_id)
    )]
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let injected = self
            .inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            metrics::counter!("bus_publish_failures_total", "topic" => topic.to_string())
                .increment(1);
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                reason: "injected publish failure".to_string(),
            });
        }

        let mut topics = self.inner.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_default();

        if entry.subscriptions.is_empty() {
            tracing::debug!("no subscriber yet, message retained");
            entry.backlog.push(envelope.clone());
        } else {
            for subscription in &entry.subscriptions {
                self.inner.pending.fetch_add(1, Ordering::SeqCst);
                if !subscription.dispatch(envelope.clone()) {
                    self.inner.finish_one();
                    return Err(TransportError::Closed);
                }
            }
        }
        drop(topics);

        self.inner
            .published
            .write()
            .await
            .push((topic.to_string(), envelope));
        metrics::counter!("bus_messages_published_total", "topic" => topic.to_string())
            .increment(1);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition_key: PartitionKeyFn,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let worker_count = self.inner.config.partition_workers.max(1);
        let mut shards = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for shard in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            shards.push(tx);

            let worker = Worker {
                topic: topic.to_string(),
                handler: Arc::clone(&handler),
                inner: Arc::clone(&self.inner),
            };
            let span = tracing::info_span!("bus.worker", topic = %topic, shard);
            handles.push(tokio::spawn(worker.run(rx).instrument(span)));
        }

        let subscription = Subscription {
            partition_key,
            shards,
        };

        let mut topics = self.inner.topics.write().await;
        let entry = topics.entry(topic.to_string()).or_default();
        let backlog = std::mem::take(&mut entry.backlog);
        if !backlog.is_empty() {
            tracing::info!(topic, messages = backlog.len(), "delivering retained messages");
        }
        for envelope in backlog {
            self.inner.pending.fetch_add(1, Ordering::SeqCst);
            if !subscription.dispatch(envelope) {
                self.inner.finish_one();
            }
        }
        entry.subscriptions.push(subscription);
        drop(topics);

        self.inner.workers.lock().await.extend(handles);
        tracing::info!(topic, workers = worker_count, "subscribed");
        Ok(())
    }
}

struct Worker {
    topic: String,
    handler: Arc<dyn MessageHandler>,
    inner: Arc<Inner>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            self.deliver(envelope).await;
            self.inner.finish_one();
        }
    }

    async fn deliver(&self, mut envelope: Envelope) {
        let deadline = self.inner.config.ack_deadline;
        let mut attempts = Vec::new();
        let mut deliveries = 0;

        loop {
            deliveries += 1;
            let outcome = tokio::time::timeout(deadline, self.handler.handle(&envelope)).await;

            let error = match outcome {
                Ok(Ok(())) => {
                    metrics::counter!("bus_messages_delivered_total", "topic" => self.topic.clone())
                        .increment(1);
                    return;
                }
                Ok(Err(HandlerError::Permanent(reason))) => {
                    attempts.push(AttemptRecord::now(envelope.attempt, reason.clone()));
                    self.dead_letter(envelope, reason, attempts).await;
                    return;
                }
                Ok(Err(HandlerError::Retryable(reason))) => reason,
                Err(_) => format!("not acknowledged within {}ms", deadline.as_millis()),
            };

            attempts.push(AttemptRecord::now(envelope.attempt, error.clone()));

            if deliveries >= self.inner.config.max_deliveries {
                self.dead_letter(envelope, "delivery budget exhausted".to_string(), attempts)
                    .await;
                return;
            }

            tracing::warn!(
                message_type = %envelope.message_type,
                order_id = %envelope.correlation_id,
                attempt = envelope.attempt,
                %error,
                "redelivering message"
            );
            metrics::counter!("bus_redeliveries_total", "topic" => self.topic.clone()).increment(1);
            envelope = envelope.redelivered();
        }
    }

    async fn dead_letter(&self, envelope: Envelope, reason: String, attempts: Vec<AttemptRecord>) {
        let letter = DeadLetter::new(self.topic.clone(), envelope, reason, attempts);
        if let Err(e) = self.inner.dead_letters.push(letter).await {
            tracing::error!(topic = %self.topic, error = %e, "failed to store dead letter");
        }
    }
}
