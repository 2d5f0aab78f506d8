//! Domain layer for the order fulfillment saga.
//!
//! This crate provides:
//! - The `Order` entity with its status state machine
//! - Value objects (`Money`, `Sku`, `LineItem`, `CustomerTier`)
//! - The pricing engine, a pure function from an order to its quote

pub mod error;
pub mod order;

pub use error::OrderError;
pub use order::{
    CustomerTier, LineItem, Money, Order, OrderStatus, Quote, Sku, VIP_DISCOUNT_PERCENT, price,
    quote,
};
