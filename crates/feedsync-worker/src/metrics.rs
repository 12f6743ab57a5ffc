//! Worker metrics.
//!
//! Installs the Prometheus recorder, registers the descriptions of every
//! feedsync crate, and serves `/metrics`.

use std::sync::OnceLock;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// ============================================================================
// Metric Names
// ============================================================================

/// Job run duration in seconds, labelled by job.
pub const RUN_DURATION: &str = "feedsync_job_run_duration_seconds";

/// Completed job runs, labelled by job.
pub const RUNS_TOTAL: &str = "feedsync_job_runs_total";

/// Failed job runs, labelled by job.
pub const RUN_FAILURES: &str = "feedsync_job_run_failures_total";

/// Items processed by job runs, labelled by job.
pub const RUN_ITEMS: &str = "feedsync_job_items_total";

/// Seconds since the last successful run, labelled by job.
pub const RUN_LAG: &str = "feedsync_job_lag_seconds";

/// Monitoring queue messages handled, labelled by outcome.
pub const MONITORING_MESSAGES: &str = "feedsync_monitoring_messages_total";

// ============================================================================
// Prometheus Recorder
// ============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global Prometheus recorder and registers all metric
/// descriptions.
///
/// Safe to call multiple times; later calls return the installed handle.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let handle = PROMETHEUS_HANDLE.get_or_init(|| handle).clone();

    describe_histogram!(RUN_DURATION, "Duration of job runs in seconds");
    describe_counter!(RUNS_TOTAL, "Total job runs completed");
    describe_counter!(RUN_FAILURES, "Total job runs failed");
    describe_counter!(RUN_ITEMS, "Total items processed by job runs");
    describe_gauge!(RUN_LAG, "Seconds since the last successful job run");
    describe_counter!(MONITORING_MESSAGES, "Total monitoring queue messages handled");
    feedsync_catalog::metrics::register_metrics();
    feedsync_search::metrics::register_metrics();

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// ============================================================================
// Metrics Endpoint
// ============================================================================

/// Handler for the `/metrics` endpoint.
pub async fn serve_metrics() -> impl IntoResponse {
    match prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

// ============================================================================
// Metric Recording
// ============================================================================

/// Records a successful run.
pub fn record_run(job: &str, duration_secs: f64, items: usize) {
    let labels = [("job", job.to_string())];
    histogram!(RUN_DURATION, &labels).record(duration_secs);
    counter!(RUNS_TOTAL, &labels).increment(1);
    counter!(RUN_ITEMS, &labels).increment(items as u64);
}

/// Records a failed run.
pub fn record_run_failure(job: &str) {
    counter!(RUN_FAILURES, "job" => job.to_string()).increment(1);
}

/// Updates the time since the last successful run.
pub fn set_run_lag(job: &str, lag_seconds: f64) {
    gauge!(RUN_LAG, "job" => job.to_string()).set(lag_seconds);
}

/// Records a handled monitoring message.
pub fn record_monitoring_message(outcome: &'static str) {
    counter!(MONITORING_MESSAGES, "outcome" => outcome).increment(1);
}

/// Measures one job run.
pub struct RunTimer {
    job: &'static str,
    start: Instant,
}

impl RunTimer {
    /// Starts timing a run of `job`.
    #[must_use]
    pub fn start(job: &'static str) -> Self {
        Self {
            job,
            start: Instant::now(),
        }
    }

    /// Stops the timer and records a successful run.
    pub fn finish(self, items: usize) {
        record_run(self.job, self.start.elapsed().as_secs_f64(), items);
    }
}
