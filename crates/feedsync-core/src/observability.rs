//! Observability infrastructure for feedsync.
//!
//! Initialization helpers and span constructors so that the feed, catalog,
//! and search stages log with the same field names.

use std::sync::Once;

use chrono::{DateTime, Utc};
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{other}' (expected json or pretty)")),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `feedsync_catalog=debug`)
///
/// # Example
///
/// ```rust
/// use feedsync_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates the span that wraps one synchronization iteration.
///
/// ```rust
/// use feedsync_core::observability::sync_span;
///
/// let span = sync_span("feed2catalog", 3);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn sync_span(job: &str, iteration: u64) -> Span {
    tracing::info_span!("sync", job = job, iteration = iteration)
}

/// Creates a span for a single catalog commit.
#[must_use]
pub fn commit_span(phase: &str, items: usize, timestamp: DateTime<Utc>) -> Span {
    tracing::info_span!(
        "catalog_commit",
        phase = phase,
        items = items,
        commit_timestamp = %timestamp.to_rfc3339(),
    )
}
