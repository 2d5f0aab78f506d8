//! Event bus abstraction.
//!
//! The bus is the only channel between the orchestrator and the services.
//! Delivery is at-least-once: handlers see a message again when they fail
//! with a retryable error or do not acknowledge within the deadline, so
//! every handler must be idempotent. Messages sharing a partition key are
//! delivered in publish order and never concurrently; there is no ordering
//! across keys.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{Envelope, HandlerError, Result};

/// Maps an envelope to the key that serializes its delivery.
pub type PartitionKeyFn = Arc<dyn Fn(&Envelope) -> String + Send + Sync>;

/// Partitions by correlation id, i.e. by order.
pub fn by_correlation_id() -> PartitionKeyFn {
    Arc::new(|envelope: &Envelope| envelope.partition_key().to_string())
}

/// Consumer of one topic.
///
/// Returning `Ok(())` acknowledges the message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivery of a message.
    async fn handle(&self, envelope: &Envelope) -> std::result::Result<(), HandlerError>;
}

/// Publish/subscribe transport.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Enqueues a message on a topic.
    ///
    /// Returns once the message is enqueued; fails with a
    /// [`crate::TransportError`] when it was not, in which case publishing
    /// again is safe.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()>;

    /// Attaches a handler to a topic.
    async fn subscribe(
        &self,
        topic: &str,
        partition_key: PartitionKeyFn,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;
}

#[async_trait]
impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        (**self).publish(topic, envelope).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition_key: PartitionKeyFn,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        (**self).subscribe(topic, partition_key, handler).await
    }
}
