//! Saga orchestration for order fulfillment.
//!
//! An admitted order goes through two forward steps, each a command to a
//! downstream service over the bus:
//! 1. Reserve inventory
//! 2. Ship the order
//!
//! A failed step is retried with exponential backoff behind a per-service
//! circuit breaker. When a step fails for good, the completed steps are
//! compensated in reverse order (cancel the shipment, release the
//! inventory) and the exhausted command is dead-lettered.

pub mod admission;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod instance;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod services;

#[cfg(test)]
mod test_support;

pub use admission::{Admission, AdmissionOutcome, OrderSubmission};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakers, CircuitOpen, CircuitState, Service,
};
pub use config::{PipelineConfig, SagaConfig};
pub use error::{Result, SagaError, ServiceError};
pub use instance::{SagaInstance, SagaRecord, SagaSnapshot, StepState};
pub use orchestrator::Orchestrator;
pub use pipeline::Pipeline;
pub use retry::RetryPolicy;
pub use services::{
    FaultPlan, InventoryConsumer, InventoryService, Reservation, ReservationStatus,
    ReserveOutcome, ShipOutcome, Shipment, ShipmentStatus, ShippingConsumer, ShippingService,
};
