//! Ingestion API handlers.
//!
//! The producer side only validates and enqueues. Delivery outcomes are never
//! visible here; a 201 means "queued", nothing more.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::event::NewEvent;
use crate::metrics::Metrics;
use crate::queue::{DeadLetterStore, EventQueue};
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<dyn EventQueue>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<dyn EventQueue>,
        dead_letters: Arc<dyn DeadLetterStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            queue,
            dead_letters,
            metrics,
        }
    }
}

/// Error body for non-2xx responses.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub detail: String,
}

fn error_response(code: StatusCode, status: &'static str, detail: String) -> Response {
    (code, Json(ErrorResponse { status, detail })).into_response()
}

// =============================================================================
// Events
// =============================================================================

/// Accept an event for asynchronous processing.
pub async fn create_event(
    State(state): State<AppState>,
    body: Result<Json<NewEvent>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "event_rejected");
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid",
                rejection.body_text(),
            );
        }
    };

    if let Err(e) = request.validate() {
        warn!(user_id = %request.user_id, error = %e, "event_rejected");
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "invalid", e.to_string());
    }

    let event = request.into_event();

    if let Err(e) = state.queue.enqueue(&event).await {
        state.metrics.record_transport_error();
        error!(event_id = %event.id, error = %e, "event_publish_failed");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "error",
            "queue unavailable".to_string(),
        );
    }

    state.metrics.record_published();
    info!(
        event_id = %event.id,
        user_id = %event.user_id,
        event_type = %event.event_type,
        retry_count = event.retry_count,
        "event_enqueued"
    );

    (StatusCode::CREATED, Json(event.receipt())).into_response()
}

// =============================================================================
// Health and stats
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queue: &'static str,
}

/// Health check. Always 200; a dead queue reports `degraded`.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let healthy = state.queue.health_check().await;
    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        queue: if healthy { "connected" } else { "disconnected" },
    })
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue_length: u64,
    pub dlq_length: u64,
}

/// Queue and dead-letter depths.
pub async fn stats(State(state): State<AppState>) -> Response {
    let lengths = async {
        let queue_length = state.queue.len().await?;
        let dlq_length = state.dead_letters.len().await?;
        Ok::<_, crate::queue::QueueError>(StatsResponse {
            queue_length,
            dlq_length,
        })
    };

    match lengths.await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!(error = %e, "stats_unavailable");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "error", e.to_string())
        }
    }
}

/// Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> Response {
    let queue_length = state.queue.len().await.ok();
    let dlq_length = state.dead_letters.len().await.ok();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(queue_length, dlq_length),
    )
        .into_response()
}
