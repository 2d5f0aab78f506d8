//! Circuit breaker per downstream service.
//!
//! Tracks consecutive availability failures (service-unavailable replies and
//! missed response deadlines) across all orders. Once the threshold is
//! reached the breaker opens and new commands for the service fail fast
//! until the cool-down elapses; then a single half-open probe is let
//! through, and its outcome closes or reopens the breaker.
//!
//! States:
//! - Closed: commands pass through
//! - Open: commands are rejected immediately
//! - HalfOpen: one probe command is in flight

use std::sync::Arc;
use std::time::{Duration, Instant};

use messaging::SagaStep;
use tokio::sync::Mutex;

/// A downstream service guarded by its own breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Inventory,
    Shipping,
}

impl Service {
    /// Returns the service that executes a step.
    pub fn for_step(step: SagaStep) -> Self {
        match step {
            SagaStep::ReserveInventory | SagaStep::ReleaseInventory => Service::Inventory,
            SagaStep::ShipOrder | SagaStep::CancelShipment => Service::Shipping,
        }
    }

    /// Returns the service name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Inventory => "inventory",
            Service::Shipping => "shipping",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe.
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

/// Rejection returned while the breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    /// Time left until a probe may be attempted.
    pub retry_after: Duration,
}

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CircuitOpen (retry after {}ms)",
            self.retry_after.as_millis()
        )
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn start_probe(&mut self) {
        self.probe_in_flight = true;
        self.opened_at = Some(Instant::now());
    }
}

/// Circuit breaker for one service. Cloning shares the state.
#[derive(Clone)]
pub struct CircuitBreaker {
    service: Service,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(service: Service, config: CircuitBreakerConfig) -> Self {
        Self {
            service,
            config,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            })),
        }
    }

    /// Returns the guarded service.
    pub fn service(&self) -> Service {
        self.service
    }

    /// Asks permission to send a command to the service.
    pub async fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cool_down {
                    tracing::info!(service = %self.service, "circuit breaker half-open, sending probe");
                    state.state = CircuitState::HalfOpen;
                    state.start_probe();
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        retry_after: self.config.cool_down - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                // A probe whose outcome never came back frees its slot after
                // one cool-down.
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if !state.probe_in_flight || elapsed >= self.config.cool_down {
                    state.start_probe();
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        retry_after: self.config.cool_down - elapsed,
                    })
                }
            }
        }
    }

    /// Records a reply showing the service is healthy.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;

        if state.state != CircuitState::Closed {
            tracing::info!(service = %self.service, "circuit breaker closed");
        }
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
    }

    /// Records an availability failure.
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;

        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        service = %self.service,
                        failures = state.consecutive_failures,
                        "circuit breaker opened"
                    );
                    metrics::counter!("circuit_breaker_opened_total", "service" => self.service.as_str())
                        .increment(1);
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(service = %self.service, "probe failed, circuit breaker reopened");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Returns the consecutive failure count.
    pub async fn failure_count(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    /// Manually closes the breaker.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        tracing::info!(service = %self.service, "circuit breaker manually reset");
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
    }
}

/// One breaker per downstream service.
#[derive(Clone)]
pub struct CircuitBreakers {
    inventory: CircuitBreaker,
    shipping: CircuitBreaker,
}

impl CircuitBreakers {
    /// Creates closed breakers for every service.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inventory: CircuitBreaker::new(Service::Inventory, config.clone()),
            shipping: CircuitBreaker::new(Service::Shipping, config),
        }
    }

    /// Returns the breaker for a service.
    pub fn get(&self, service: Service) -> &CircuitBreaker {
        match service {
            Service::Inventory => &self.inventory,
            Service::Shipping => &self.shipping,
        }
    }

    /// Returns the breaker guarding a step.
    pub fn for_step(&self, step: SagaStep) -> &CircuitBreaker {
        self.get(Service::for_step(step))
    }
}
