//! Fulfillment runtime entry point.

use metrics_exporter_prometheus::PrometheusBuilder;
use server::{Config, LogFormat, ServerError, driver};
use tokio::io::BufReader;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries the responses.
    match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // 1. Load configuration
    let config = Config::from_env()?;

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Expose Prometheus metrics
    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| ServerError::Metrics(e.to_string()))?;
        tracing::info!(%addr, "metrics exporter listening");
    }

    // 4. Open the store and start the pipeline
    let store = server::open_store(&config).await?;
    let pipeline = server::start(store, &config).await?;

    // 5. Serve requests from stdin until it closes or a signal arrives
    let input = BufReader::new(tokio::io::stdin());
    let output = tokio::io::stdout();
    tokio::select! {
        result = driver::run(pipeline.orchestrator.as_ref(), input, output) => {
            let handled = result?;
            tracing::info!(handled, "input closed, waiting for shutdown signal");
            shutdown_signal().await;
        }
        () = shutdown_signal() => {}
    }

    // 6. Drain in-flight work
    pipeline.shutdown().await;
    tracing::info!("fulfillment runtime shut down gracefully");
    Ok(())
}
