//! Message envelope.

use chrono::{DateTime, Utc};
use common::{MessageId, OrderId};
use serde::{Deserialize, Serialize};

use crate::Message;

/// A message together with its delivery metadata.
///
/// The correlation id is the order id and doubles as the partition key, so
/// every message of one saga is delivered in order and never concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier, generated by the producer.
    pub id: MessageId,

    /// Type tag of the payload (e.g., "ReserveInventory").
    pub message_type: String,

    /// The order this message belongs to.
    pub correlation_id: OrderId,

    /// The message that caused this one, if any.
    pub causation_id: Option<MessageId>,

    /// The message itself.
    pub payload: Message,

    /// Delivery attempt, starting at 1.
    pub attempt: u32,

    /// When the producer created the message.
    pub produced_at: DateTime<Utc>,
}

impl Envelope {
    /// Wraps a payload in a fresh envelope for the given order.
    pub fn new(correlation_id: impl Into<OrderId>, payload: Message) -> Self {
        Self {
            id: MessageId::new(),
            message_type: payload.message_type().to_string(),
            correlation_id: correlation_id.into(),
            causation_id: None,
            payload,
            attempt: 1,
            produced_at: Utc::now(),
        }
    }

    /// Sets the causation id.
    pub fn caused_by(mut self, cause: MessageId) -> Self {
        self.causation_id = Some(cause);
        self
    }

    /// Creates a reply in the same saga, caused by this envelope.
    pub fn reply(&self, payload: Message) -> Self {
        Envelope::new(self.correlation_id.clone(), payload).caused_by(self.id)
    }

    /// Returns a copy for the next delivery attempt. Identity is unchanged.
    pub fn redelivered(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Returns the partition key used for ordering.
    pub fn partition_key(&self) -> &str {
        self.correlation_id.as_str()
    }
}
