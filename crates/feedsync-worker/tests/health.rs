//! Health and readiness endpoint tests.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use feedsync_worker::health;
use feedsync_worker::runner::RunnerState;

async fn get(state: &Arc<RunnerState>, uri: &str) -> Result<(StatusCode, Value)> {
    let request = Request::builder()
        .uri(uri)
        .body(Body::empty())
        .context("build request")?;
    let response = health::router(Arc::clone(state))
        .oneshot(request)
        .await
        .map_err(|err| match err {})?;
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .context("read response body")?;
    let json = serde_json::from_slice(&body).context("parse response body")?;
    Ok((status, json))
}

#[tokio::test]
async fn health_is_always_ok() -> Result<()> {
    let state = Arc::new(RunnerState::new(Duration::from_secs(300)));
    let (status, body) = get(&state, "/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn ready_reports_startup_then_first_run() -> Result<()> {
    let state = Arc::new(RunnerState::new(Duration::from_secs(300)));

    let (status, body) = get(&state, "/ready").await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);
    assert_eq!(body["message"], "Service starting up");

    state.mark_ready();
    let (status, body) = get(&state, "/ready").await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["message"], "Waiting for first successful run");

    state.record_failure();
    state.record_success();
    let (status, body) = get(&state, "/ready").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["successful_runs"], 1);
    assert_eq!(body["failed_runs"], 1);
    assert!(body["last_successful_run"].is_string());
    assert!(body.get("message").is_none());
    Ok(())
}

#[tokio::test]
async fn ready_turns_unhealthy_after_the_threshold() -> Result<()> {
    let state = Arc::new(RunnerState::new(Duration::ZERO));
    state.mark_ready();
    state.record_success();

    let (status, body) = get(&state, "/ready").await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["healthy"], false);
    assert_eq!(body["message"], "No successful run in 0 seconds");
    Ok(())
}
