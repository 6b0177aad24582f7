//! Queue consumer runtime.
//!
//! Builds the shared collaborators, runs `WORKER_COUNT` sequential workers
//! against the broker queue, serves health and metrics on `METRICS_PORT`, and
//! stops on SIGINT/SIGTERM. Each worker finishes its in-flight event before
//! exiting.
//!
//! This process holds the queue's exclusive consumer, so its rate limiter
//! sees every send. A second consumer process refuses to start.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use eventflow::queue::{Backend, QueueError};
use eventflow::web::ops_router;
use eventflow::{
    deliver, spawn_workers, AppState, Config, Metrics, RateLimiter, WorkerContext,
};

/// Run the queue consumer.
///
/// This function:
/// 1. Builds the queue backend (must be shared, i.e. AMQP)
/// 2. Claims the exclusive consumer on the queue
/// 3. Picks the delivery collaborator from the configuration
/// 4. Spawns the workers sharing one rate limiter and one metrics collector
/// 5. Serves `/health`, `/stats` and `/metrics`
/// 6. Waits for a shutdown signal and drains the workers
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);

    let backend = Backend::from_config(&config);
    if backend.is_in_process() {
        bail!(
            "QUEUE_URL selects the in-process memory queue; run eventflow-web, \
             which hosts the workers itself, or point QUEUE_URL at a broker"
        );
    }

    match backend.claim_consumer().await {
        Ok(()) => info!(queue = %config.queue_name, "queue_consumer_claimed"),
        Err(QueueError::ConsumerBusy { queue }) => bail!(
            "queue {} already has a consumer; run a single eventflow-worker \
             process and scale with WORKER_COUNT so one daily limit covers every send",
            queue
        ),
        // Retried by the workers once the broker is back.
        Err(e) => warn!(error = %e, "queue_unreachable_at_startup"),
    }

    let delivery = deliver::from_config(&config).context("Failed to create delivery client")?;
    info!(
        mailgun_configured = config.mailgun.is_some(),
        daily_email_limit = config.daily_email_limit,
        alert_email_configured = config.alert_email.is_some(),
        "delivery_ready"
    );

    let metrics = Arc::new(Metrics::new());
    let ctx = WorkerContext {
        queue: backend.queue.clone(),
        dead_letters: backend.dead_letters.clone(),
        delivery,
        limiter: Arc::new(RateLimiter::new(config.daily_email_limit)),
        metrics: metrics.clone(),
        config: config.clone(),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics address")?;
    let ops = ops_router(AppState::new(
        config.clone(),
        backend.queue.clone(),
        backend.dead_letters.clone(),
        metrics,
    ));

    let shutdown = CancellationToken::new();
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, ops)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        })
    };
    info!(address = %addr, "metrics_server_listening");

    let handles = spawn_workers(&ctx, config.worker_count, &shutdown);
    info!(workers = handles.len(), "worker_ready");

    shutdown_signal().await;
    info!("worker_stopping");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "worker_task_failed");
        }
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "metrics_server_error"),
        Err(e) => error!(error = %e, "metrics_server_task_failed"),
    }

    backend.close().await;

    info!("worker_shutdown_complete");
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
}
