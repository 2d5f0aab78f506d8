//! Saga error types.

use common::OrderId;
use domain::OrderError;
use messaging::{HandlerError, TransportError};
use store::StoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// An order with the same id was already admitted.
    #[error("Duplicate order: {0}")]
    DuplicateOrder(OrderId),

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// A message arrived on the orchestrator topic that it does not handle.
    #[error("Unexpected message '{message_type}' for order {order_id}")]
    UnexpectedMessage {
        order_id: OrderId,
        message_type: String,
    },

    /// Domain error.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<SagaError> for HandlerError {
    fn from(err: SagaError) -> Self {
        match err {
            SagaError::Store(e) => e.into(),
            SagaError::Transport(e) => e.into(),
            other => HandlerError::permanent(other),
        }
    }
}

/// Errors raised by the downstream services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service is down or refused to process the command.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The service's own storage failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ServiceError> for HandlerError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(reason) => HandlerError::Retryable(reason),
            ServiceError::Store(e) => e.into(),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
