//! Runtime configuration loaded from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use domain::Sku;
use saga::PipelineConfig;

use crate::error::ConfigError;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Runtime configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory store when unset
/// - `METRICS_ADDR`: Prometheus listener address; no exporter when unset
/// - `PARTITION_WORKERS`, `BUS_ACK_DEADLINE_MS`, `BUS_MAX_DELIVERIES`
/// - `RETRY_MAX_ATTEMPTS`, `RETRY_INITIAL_BACKOFF_MS`, `RETRY_MAX_BACKOFF_MS`,
///   `RETRY_MULTIPLIER`, `RETRY_JITTER`
/// - `BREAKER_FAILURE_THRESHOLD`, `BREAKER_COOL_DOWN_MS`
/// - `RESPONSE_TIMEOUT_MS`, `SCHEDULER_TICK_MS`, `IDEMPOTENCY_RETENTION_SECS`
/// - `INITIAL_STOCK`: `SKU=QTY,...` restocked at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
    pub pipeline: PipelineConfig,
    pub initial_stock: Vec<(Sku, u32)>,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Loads configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };
        let mut pipeline = PipelineConfig::default();

        let bus = &mut pipeline.bus;
        bus.partition_workers = env.parse("PARTITION_WORKERS", bus.partition_workers)?;
        bus.ack_deadline = env.millis("BUS_ACK_DEADLINE_MS", bus.ack_deadline)?;
        bus.max_deliveries = env.parse("BUS_MAX_DELIVERIES", bus.max_deliveries)?;
        if bus.partition_workers == 0 {
            return Err(ConfigError::invalid("PARTITION_WORKERS", "0", "must be positive"));
        }

        let retry = &mut pipeline.saga.retry;
        retry.max_attempts = env.parse("RETRY_MAX_ATTEMPTS", retry.max_attempts)?;
        retry.initial_backoff = env.millis("RETRY_INITIAL_BACKOFF_MS", retry.initial_backoff)?;
        retry.max_backoff = env.millis("RETRY_MAX_BACKOFF_MS", retry.max_backoff)?;
        retry.multiplier = env.parse("RETRY_MULTIPLIER", retry.multiplier)?;
        retry.jitter = env.parse("RETRY_JITTER", retry.jitter)?;
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::invalid(
                "RETRY_JITTER",
                &retry.jitter.to_string(),
                "must be between 0 and 1",
            ));
        }

        let breaker = &mut pipeline.saga.breaker;
        breaker.failure_threshold =
            env.parse("BREAKER_FAILURE_THRESHOLD", breaker.failure_threshold)?;
        breaker.cool_down = env.millis("BREAKER_COOL_DOWN_MS", breaker.cool_down)?;

        pipeline.saga.response_timeout =
            env.millis("RESPONSE_TIMEOUT_MS", pipeline.saga.response_timeout)?;
        pipeline.scheduler_tick = env.millis("SCHEDULER_TICK_MS", pipeline.scheduler_tick)?;
        pipeline.idempotency_retention = Duration::from_secs(env.parse(
            "IDEMPOTENCY_RETENTION_SECS",
            pipeline.idempotency_retention.as_secs(),
        )?);

        let log_format = match env.get("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "LOG_FORMAT",
                    other,
                    "expected text or json",
                ));
            }
        };

        let metrics_addr = match env.get("METRICS_ADDR") {
            Some(addr) => Some(
                addr.parse()
                    .map_err(|e| ConfigError::invalid("METRICS_ADDR", &addr, e))?,
            ),
            None => None,
        };

        let initial_stock = match env.get("INITIAL_STOCK") {
            Some(raw) => parse_stock(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            log_level: env.get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            log_format,
            database_url: env.get("DATABASE_URL"),
            metrics_addr,
            pipeline,
            initial_stock,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            metrics_addr: None,
            pipeline: PipelineConfig::default(),
            initial_stock: Vec::new(),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|value| !value.trim().is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid(var, &value, e)),
            None => Ok(default),
        }
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let millis = self.parse(var, default.as_millis() as u64)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Parses `SKU=QTY,SKU=QTY`.
fn parse_stock(raw: &str) -> Result<Vec<(Sku, u32)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (sku, quantity) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::invalid("INITIAL_STOCK", entry, "expected SKU=QTY"))?;
            let sku = sku.trim();
            if sku.is_empty() {
                return Err(ConfigError::invalid("INITIAL_STOCK", entry, "empty sku"));
            }
            let quantity = quantity
                .trim()
                .parse()
                .map_err(|e| ConfigError::invalid("INITIAL_STOCK", entry, e))?;
            Ok((Sku::new(sku), quantity))
        })
        .collect()
}
