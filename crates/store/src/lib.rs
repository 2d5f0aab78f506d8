//! Durable key/value persistence with optimistic concurrency.
//!
//! Every persisted entity in the pipeline (orders, saga instances,
//! reservations, shipments, idempotency keys, delay-queue entries and dead
//! letters) lives in a [`KeyValueStore`]: records are addressed by
//! `(namespace, key)` and carry a [`Version`] that every write must match.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod repository;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use record::{Record, Version};
pub use repository::Repository;
pub use store::{KeyValueStore, StoreExt};
