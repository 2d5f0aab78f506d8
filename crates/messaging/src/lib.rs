//! At-least-once messaging for the fulfillment saga.
//!
//! This crate provides:
//! - [`Envelope`] and the closed [`Message`] set exchanged by the saga
//! - The [`EventBus`] contract and an in-memory, partition-ordered bus
//! - The [`IdempotencyStore`] services consult before any side effect
//! - The [`DeadLetterSink`] for messages that exhaust their budget
//! - A durable [`DelayQueue`] drained by the [`RetryScheduler`]

pub mod bus;
pub mod dead_letter;
pub mod delay_queue;
pub mod envelope;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod message;
pub mod topics;

pub use bus::{EventBus, MessageHandler, PartitionKeyFn, by_correlation_id};
pub use dead_letter::{AttemptRecord, DeadLetter, DeadLetterSink, StoreDeadLetterSink};
pub use delay_queue::{
    DelayQueue, DelayedMessage, RetryScheduler, SchedulerHandle, StoreDelayQueue,
};
pub use envelope::Envelope;
pub use error::{HandlerError, Result, TransportError};
pub use idempotency::{IdempotencyCheck, IdempotencyStore};
pub use memory::{BusConfig, InMemoryEventBus};
pub use message::{InventoryRejection, Message, SagaStep, ShippingFailure};
