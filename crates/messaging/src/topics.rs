//! Topic names.

/// Control messages and service replies consumed by the orchestrator.
pub const ORCHESTRATOR: &str = "orders.saga";

/// Commands consumed by the inventory service.
pub const INVENTORY_COMMANDS: &str = "inventory.commands";

/// Commands consumed by the shipping service.
pub const SHIPPING_COMMANDS: &str = "shipping.commands";
