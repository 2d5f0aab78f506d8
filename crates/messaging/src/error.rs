//! Messaging error types.

use store::StoreError;
use thiserror::Error;

/// Errors raised by the transport: publishing, scheduling and dead-lettering.
///
/// Every variant is transient from the caller's point of view: the message
/// was not enqueued and publishing it again is safe.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The bus refused the message.
    #[error("Publish to '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    /// The bus has been shut down.
    #[error("Event bus is closed")]
    Closed,

    /// The durable backing store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure reported by a message handler instead of an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The message should be delivered again.
    #[error("Retryable handler failure: {0}")]
    Retryable(String),

    /// The message can never be processed and goes to the dead-letter sink.
    #[error("Permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Creates a retryable failure.
    pub fn retryable(reason: impl ToString) -> Self {
        Self::Retryable(reason.to_string())
    }

    /// Creates a permanent failure.
    pub fn permanent(reason: impl ToString) -> Self {
        Self::Permanent(reason.to_string())
    }

    /// Returns true if the bus should redeliver the message.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(e) => HandlerError::Permanent(e.to_string()),
            other => HandlerError::Retryable(other.to_string()),
        }
    }
}

impl From<TransportError> for HandlerError {
    fn from(err: TransportError) -> Self {
        HandlerError::Retryable(err.to_string())
    }
}

/// Convenience type alias for transport results.
pub type Result<T> = std::result::Result<T, TransportError>;
