//! The closed set of messages exchanged by the saga.

use domain::LineItem;
use serde::{Deserialize, Serialize};

use crate::topics;

/// A step the orchestrator issues a command for.
///
/// Forward steps move the order along; compensation steps undo them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SagaStep {
    ReserveInventory,
    ShipOrder,
    CancelShipment,
    ReleaseInventory,
}

impl SagaStep {
    /// Returns true for steps that undo earlier work.
    pub fn is_compensation(&self) -> bool {
        matches!(self, SagaStep::ReleaseInventory | SagaStep::CancelShipment)
    }

    /// Returns the topic the step's command is published to.
    pub fn topic(&self) -> &'static str {
        match self {
            SagaStep::ReserveInventory | SagaStep::ReleaseInventory => topics::INVENTORY_COMMANDS,
            SagaStep::ShipOrder | SagaStep::CancelShipment => topics::SHIPPING_COMMANDS,
        }
    }

    /// Returns the step name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::ReserveInventory => "reserve_inventory",
            SagaStep::ShipOrder => "ship_order",
            SagaStep::CancelShipment => "cancel_shipment",
            SagaStep::ReleaseInventory => "release_inventory",
        }
    }
}

impl std::fmt::Display for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why inventory refused a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryRejection {
    /// Not enough stock for at least one sku. Permanent for the attempt.
    InsufficientStock,
    /// The reservation was released before it was made. Permanent.
    ReservationReleased,
    /// The service could not process the command. Retryable.
    ServiceUnavailable,
}

impl InventoryRejection {
    /// Returns true if the orchestrator should retry the command.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InventoryRejection::ServiceUnavailable)
    }
}

impl std::fmt::Display for InventoryRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InventoryRejection::InsufficientStock => write!(f, "InsufficientStock"),
            InventoryRejection::ReservationReleased => write!(f, "ReservationReleased"),
            InventoryRejection::ServiceUnavailable => write!(f, "ServiceUnavailable"),
        }
    }
}

/// Why shipping refused a shipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShippingFailure {
    /// The carrier cannot deliver the order. Permanent.
    Undeliverable,
    /// The shipment was cancelled before it was created. Permanent.
    ShipmentCancelled,
    /// The service could not process the command. Retryable.
    ServiceUnavailable,
}

impl ShippingFailure {
    /// Returns true if the orchestrator should retry the command.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShippingFailure::ServiceUnavailable)
    }
}

impl std::fmt::Display for ShippingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShippingFailure::Undeliverable => write!(f, "Undeliverable"),
            ShippingFailure::ShipmentCancelled => write!(f, "ShipmentCancelled"),
            ShippingFailure::ServiceUnavailable => write!(f, "ServiceUnavailable"),
        }
    }
}

/// Every payload that can travel in an [`crate::Envelope`].
///
/// The orchestrator switches on these variants explicitly; there is no
/// dynamic dispatch on payload shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    // Orchestrator control messages
    /// Begins the saga for an admitted order.
    StartSaga,
    /// Asks the orchestrator to cancel the order.
    CancelOrder,
    /// A retry of `step` scheduled after `attempt` failed attempts is due.
    RetryDue { step: SagaStep, attempt: u32 },
    /// The reply to `attempt` of `step` did not arrive in time.
    ResponseTimeout { step: SagaStep, attempt: u32 },

    // Commands
    ReserveInventory {
        items: Vec<LineItem>,
        idempotency_key: String,
    },
    ReleaseInventory {
        idempotency_key: String,
    },
    ShipOrder {
        idempotency_key: String,
    },
    CancelShipment {
        idempotency_key: String,
    },

    // Events
    InventoryReserved,
    InventoryRejected {
        reason: InventoryRejection,
    },
    InventoryReleased,
    InventoryReleaseFailed {
        reason: String,
    },
    Shipped {
        carrier_ref: String,
    },
    ShippingFailed {
        reason: ShippingFailure,
    },
    ShipmentCancelled,
    ShipmentCancelFailed {
        reason: String,
    },
}

impl Message {
    /// Returns the type tag of the message.
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::StartSaga => "StartSaga",
            Message::CancelOrder => "CancelOrder",
            Message::RetryDue { .. } => "RetryDue",
            Message::ResponseTimeout { .. } => "ResponseTimeout",
            Message::ReserveInventory { .. } => "ReserveInventory",
            Message::ReleaseInventory { .. } => "ReleaseInventory",
            Message::ShipOrder { .. } => "ShipOrder",
            Message::CancelShipment { .. } => "CancelShipment",
            Message::InventoryReserved => "InventoryReserved",
            Message::InventoryRejected { .. } => "InventoryRejected",
            Message::InventoryReleased => "InventoryReleased",
            Message::InventoryReleaseFailed { .. } => "InventoryReleaseFailed",
            Message::Shipped { .. } => "Shipped",
            Message::ShippingFailed { .. } => "ShippingFailed",
            Message::ShipmentCancelled => "ShipmentCancelled",
            Message::ShipmentCancelFailed { .. } => "ShipmentCancelFailed",
        }
    }

    /// Returns the step a command message performs.
    pub fn command_step(&self) -> Option<SagaStep> {
        match self {
            Message::ReserveInventory { .. } => Some(SagaStep::ReserveInventory),
            Message::ReleaseInventory { .. } => Some(SagaStep::ReleaseInventory),
            Message::ShipOrder { .. } => Some(SagaStep::ShipOrder),
            Message::CancelShipment { .. } => Some(SagaStep::CancelShipment),
            _ => None,
        }
    }

    /// Returns the step a reply message answers.
    pub fn reply_step(&self) -> Option<SagaStep> {
        match self {
            Message::InventoryReserved | Message::InventoryRejected { .. } => {
                Some(SagaStep::ReserveInventory)
            }
            Message::InventoryReleased | Message::InventoryReleaseFailed { .. } => {
                Some(SagaStep::ReleaseInventory)
            }
            Message::Shipped { .. } | Message::ShippingFailed { .. } => Some(SagaStep::ShipOrder),
            Message::ShipmentCancelled | Message::ShipmentCancelFailed { .. } => {
                Some(SagaStep::CancelShipment)
            }
            _ => None,
        }
    }

    /// Returns the idempotency key carried by a command.
    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            Message::ReserveInventory {
                idempotency_key, ..
            }
            | Message::ReleaseInventory { idempotency_key }
            | Message::ShipOrder { idempotency_key }
            | Message::CancelShipment { idempotency_key } => Some(idempotency_key),
            _ => None,
        }
    }
}
