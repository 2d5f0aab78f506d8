//! Domain error types.

use thiserror::Error;

use crate::order::OrderStatus;

/// Errors that can occur during order operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// The order cannot be priced. Permanent, never retried.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// The order is not in a state that allows the requested transition.
    #[error("Invalid state transition: cannot move from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// The order has already reached a terminal status.
    #[error("Order cannot be cancelled in {status} state")]
    NotCancellable { status: OrderStatus },
}

/// Result type for order operations.
pub type Result<T> = std::result::Result<T, OrderError>;
