//! EventFlow Worker - queue consumer that delivers events.
//!
//! Pulls events from the broker queue, enforces the daily send limit, and
//! retries or dead-letters failed deliveries.

mod consumer;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use eventflow::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        queue_backend = config.queue_backend.scheme(),
        queue_name = %config.queue_name,
        dlq_name = %config.dlq_name,
        max_retries = config.max_retries,
        retry_delay_ms = config.retry_delay.as_millis() as u64,
        worker_count = config.worker_count,
        metrics_port = config.metrics_port,
        "config_loaded"
    );

    consumer::run(config).await?;

    Ok(())
}
