//! Downstream services and their bus consumers.

pub mod faults;
pub mod inventory;
pub mod shipping;

pub use faults::FaultPlan;
pub use inventory::{
    InventoryConsumer, InventoryService, Reservation, ReservationStatus, ReserveOutcome,
    ReservedItem,
};
pub use shipping::{ShipOutcome, Shipment, ShipmentStatus, ShippingConsumer, ShippingService};
