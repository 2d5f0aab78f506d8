//! Typed configuration for the orchestrator and the pipeline.

use std::time::Duration;

use messaging::BusConfig;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::RetryPolicy;

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaConfig {
    /// Retry policy applied to every step.
    pub retry: RetryPolicy,
    /// Breaker tuning shared by every service.
    pub breaker: CircuitBreakerConfig,
    /// How long to wait for a reply before treating the attempt as failed.
    pub response_timeout: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything needed to wire a [`crate::Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub saga: SagaConfig,
    pub bus: BusConfig,
    /// How often the retry scheduler polls the delay queue.
    pub scheduler_tick: Duration,
    /// Retention of idempotency keys in the services.
    pub idempotency_retention: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            saga: SagaConfig::default(),
            bus: BusConfig::default(),
            scheduler_tick: Duration::from_millis(50),
            idempotency_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}
