//! Health endpoints.
//!
//! - `GET /health`: shallow liveness check (always 200)
//! - `GET /ready`: 200 once the runner is ready and has succeeded within the
//!   unhealthy threshold, 503 otherwise
//! - `GET /metrics`: Prometheus text format

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::metrics;
use crate::runner::RunnerState;

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
struct ReadyResponse {
    ready: bool,
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_successful_run: Option<String>,
    successful_runs: u64,
    failed_runs: u64,
    run_in_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn ready(State(state): State<Arc<RunnerState>>) -> impl IntoResponse {
    let ready = state.is_ready();
    let healthy = state.is_healthy();
    let successful_runs = state.successful_runs();

    let message = if !ready {
        Some("Service starting up".to_string())
    } else if successful_runs == 0 {
        Some("Waiting for first successful run".to_string())
    } else if !healthy {
        Some(format!(
            "No successful run in {} seconds",
            state.unhealthy_threshold().as_secs()
        ))
    } else {
        None
    };

    let status = if ready && healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            healthy,
            last_successful_run: state.last_success().map(|ts| ts.to_rfc3339()),
            successful_runs,
            failed_runs: state.failed_runs(),
            run_in_progress: state.run_in_progress(),
            message,
        }),
    )
}

/// Builds the health router over `state`.
pub fn router(state: Arc<RunnerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics::serve_metrics))
        .with_state(state)
}
