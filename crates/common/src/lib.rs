//! Identifier types shared by every crate in the fulfillment pipeline.

mod types;

pub use types::{CustomerId, MessageId, OrderId};
