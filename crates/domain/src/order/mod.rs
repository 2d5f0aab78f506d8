//! Order entity and related types.

mod aggregate;
mod pricing;
mod state;
mod value_objects;

pub use aggregate::Order;
pub use pricing::{Quote, VIP_DISCOUNT_PERCENT, price, quote};
pub use state::OrderStatus;
pub use value_objects::{CustomerTier, LineItem, Money, Sku};
