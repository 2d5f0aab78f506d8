//! Runtime for the order fulfillment pipeline.
//!
//! Wires the store, the bus, the services and the orchestrator from
//! environment configuration, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod driver;
pub mod error;

use std::sync::Arc;

use saga::Pipeline;
use store::{InMemoryStore, KeyValueStore, PostgresStore};

pub use config::{Config, LogFormat};
pub use error::{ConfigError, Result, ServerError};

/// Store shared by every component of the pipeline.
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Opens the configured store: PostgreSQL when a database url is set,
/// in-memory otherwise.
pub async fn open_store(config: &Config) -> Result<SharedStore> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url).await?;
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Starts the pipeline and applies the initial stock.
pub async fn start(store: SharedStore, config: &Config) -> Result<Pipeline<SharedStore>> {
    let pipeline = Pipeline::start(store, config.pipeline.clone()).await?;

    for (sku, quantity) in &config.initial_stock {
        pipeline
            .inventory
            .restock(sku, *quantity)
            .await?;
        tracing::info!(%sku, quantity, "stock loaded");
    }

    Ok(pipeline)
}
