//! EventFlow Web Server - event ingestion API.
//!
//! This binary provides a thin web server that:
//! - Validates incoming events
//! - Enqueues them and returns a receipt immediately
//! - Reports health, queue stats and metrics
//!
//! With the in-process memory queue the workers run inside this process too.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use eventflow::queue::Backend;
use eventflow::web::router;
use eventflow::{deliver, spawn_workers, AppState, Config, Metrics, RateLimiter, WorkerContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!(
        port = config.port,
        queue_backend = config.queue_backend.scheme(),
        queue_name = %config.queue_name,
        mailgun_configured = config.mailgun.is_some(),
        "config_loaded"
    );

    let backend = Backend::from_config(&config);
    let metrics = Arc::new(Metrics::new());

    // The memory queue is only reachable from this process
    let shutdown = CancellationToken::new();
    let workers = if backend.is_in_process() {
        let ctx = WorkerContext {
            queue: backend.queue.clone(),
            dead_letters: backend.dead_letters.clone(),
            delivery: deliver::from_config(&config)
                .context("Failed to create delivery client")?,
            limiter: Arc::new(RateLimiter::new(config.daily_email_limit)),
            metrics: metrics.clone(),
            config: config.clone(),
        };
        let handles = spawn_workers(&ctx, config.worker_count, &shutdown);
        info!(workers = handles.len(), "embedded_workers_started");
        handles
    } else {
        Vec::new()
    };

    let state = AppState::new(
        config.clone(),
        backend.queue.clone(),
        backend.dead_letters.clone(),
        metrics,
    );
    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "worker_task_failed");
        }
    }

    backend.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
