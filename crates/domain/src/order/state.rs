//! Order status state machine.

use serde::{Deserialize, Serialize};

/// The status of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// Created ──► Validated ──► ReservingInventory ──► InventoryReserved ──► Shipping ──► Shipped
///    │            │                 │                      │                 │
///    │            │                 └──────────────────────┴─────────────────┴──► Compensating
///    │            │                                                                 │      │
///    ├────────────┴──► Cancelled ◄──────────────────────────────────────────────────┘      │
///    └──► Rejected                                                               Failed ◄──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Order was submitted but not yet priced.
    #[default]
    Created,

    /// Pricing succeeded and the order was admitted.
    Validated,

    /// A `ReserveInventory` command is outstanding.
    ReservingInventory,

    /// Stock is held for the order.
    InventoryReserved,

    /// A `ShipOrder` command is outstanding.
    Shipping,

    /// The order shipped (terminal state).
    Shipped,

    /// Compensating commands are undoing completed steps.
    Compensating,

    /// The saga failed after compensation (terminal state).
    Failed,

    /// Pricing rejected the order (terminal state).
    Rejected,

    /// The order was cancelled (terminal state).
    Cancelled,
}

impl OrderStatus {
    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        matches!(
            (self, next),
            (Created, Validated | Rejected | Cancelled)
                | (Validated, ReservingInventory | Cancelled)
                | (ReservingInventory, InventoryReserved | Compensating)
                | (InventoryReserved, Shipping | Compensating)
                | (Shipping, Shipped | Compensating)
                | (Compensating, Failed | Cancelled)
        )
    }

    /// Returns true if the order can be cancelled without compensation.
    pub fn can_cancel_directly(&self) -> bool {
        matches!(self, OrderStatus::Created | OrderStatus::Validated)
    }

    /// Returns true if some downstream side effect may already exist.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            OrderStatus::ReservingInventory | OrderStatus::InventoryReserved | OrderStatus::Shipping
        )
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Shipped
                | OrderStatus::Failed
                | OrderStatus::Rejected
                | OrderStatus::Cancelled
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "Created",
            OrderStatus::Validated => "Validated",
            OrderStatus::ReservingInventory => "ReservingInventory",
            OrderStatus::InventoryReserved => "InventoryReserved",
            OrderStatus::Shipping => "Shipping",
            OrderStatus::Shipped => "Shipped",
            OrderStatus::Compensating => "Compensating",
            OrderStatus::Failed => "Failed",
            OrderStatus::Rejected => "Rejected",
            OrderStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
