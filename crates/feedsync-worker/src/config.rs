//! Command-line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

use feedsync_catalog::SyncConfig;
use feedsync_catalog::feed_http::DEFAULT_FEED_TIMEOUT;
use feedsync_core::LogFormat;
use feedsync_search::export::DEFAULT_KEYS_PER_RANGE;
use feedsync_search::{Catalog2SearchConfig, ExportConfig};
use feedsync_search::batch_pusher::DEFAULT_BATCH_SIZE;

use crate::runner::RunnerConfig;

/// Keeps a package gallery feed, its catalog, and the search indexes in sync.
#[derive(Debug, Parser)]
#[command(name = "feedsync-worker")]
#[command(about = "Synchronizes a package feed into a catalog and search indexes")]
#[command(version)]
pub struct Cli {
    /// Root directory of the storage backend.
    #[arg(long, env = "FEEDSYNC_STORAGE_ROOT", global = true, default_value = "./feedsync-data")]
    pub storage_root: PathBuf,

    /// Log output format (`json` or `pretty`).
    #[arg(long, env = "FEEDSYNC_LOG_FORMAT", global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Job to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Worker jobs.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Copy feed changes into the catalog.
    Feed2catalog {
        /// Base URL of the package gallery.
        #[arg(long, env = "FEEDSYNC_GALLERY")]
        gallery: String,

        /// Maximum packages requested from the feed per phase.
        #[arg(long, env = "FEEDSYNC_TOP", default_value_t = 20)]
        top: usize,

        /// Skip the creates phase.
        #[arg(long, env = "FEEDSYNC_SKIP_CREATED")]
        skip_created: bool,

        /// Starting point when the catalog has no created watermark (RFC 3339).
        #[arg(long, env = "FEEDSYNC_START_DATE")]
        start_date: Option<DateTime<Utc>>,

        /// How far behind the delete watermark the audit trail is queried.
        #[arg(long, env = "FEEDSYNC_DELETE_LOOKBACK_SECS", default_value_t = 900)]
        delete_lookback_secs: u64,

        /// Pause between delete-segment commits, in milliseconds.
        #[arg(long, env = "FEEDSYNC_COMMIT_SPACING_MS", default_value_t = 1000)]
        commit_spacing_ms: u64,

        /// Feed request timeout.
        #[arg(long, env = "FEEDSYNC_HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_FEED_TIMEOUT.as_secs())]
        http_timeout_secs: u64,

        #[allow(missing_docs)]
        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Publish catalog commits to the search indexes.
    Catalog2search {
        /// Maximum actions per index batch.
        #[arg(long, env = "FEEDSYNC_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Maximum catalog commits published per pass.
        #[arg(long, env = "FEEDSYNC_MAX_COMMITS_PER_PASS", default_value_t = 100)]
        max_commits_per_pass: usize,

        #[allow(missing_docs)]
        #[command(flatten)]
        service: ServiceArgs,
    },

    /// Populate empty search indexes from the whole catalog, then create the
    /// publication cursor. Runs once.
    Backfill {
        /// Maximum package ids per export range.
        #[arg(long, env = "FEEDSYNC_KEYS_PER_RANGE", default_value_t = DEFAULT_KEYS_PER_RANGE)]
        keys_per_range: usize,

        /// Maximum actions per index batch.
        #[arg(long, env = "FEEDSYNC_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Export ranges indexed concurrently.
        #[arg(long, env = "FEEDSYNC_PARALLELISM", default_value_t = 4)]
        parallelism: usize,
    },

    /// Validate packages named by the monitoring queue.
    Monitor {
        #[allow(missing_docs)]
        #[command(flatten)]
        service: ServiceArgs,
    },
}

/// Options shared by every looping job.
#[derive(Debug, Clone, Args)]
pub struct ServiceArgs {
    /// HTTP port for health endpoints.
    #[arg(long, env = "FEEDSYNC_PORT", default_value_t = 8081)]
    pub port: u16,

    /// Pause between runs, in seconds.
    #[arg(long, env = "FEEDSYNC_INTERVAL_SECS", default_value_t = 60)]
    pub interval_secs: u64,

    /// Maximum time without a successful run before unhealthy, in seconds.
    #[arg(long, env = "FEEDSYNC_UNHEALTHY_THRESHOLD_SECS", default_value_t = 300)]
    pub unhealthy_threshold_secs: u64,

    /// Run once until caught up, then exit.
    #[arg(long)]
    pub once: bool,
}

impl ServiceArgs {
    /// Runner settings.
    #[must_use]
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            interval: Duration::from_secs(self.interval_secs),
            unhealthy_threshold: Duration::from_secs(self.unhealthy_threshold_secs),
        }
    }
}

impl Command {
    /// Job name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Feed2catalog { .. } => "feed2catalog",
            Self::Catalog2search { .. } => "catalog2search",
            Self::Backfill { .. } => "backfill",
            Self::Monitor { .. } => "monitoring",
        }
    }

    /// Options shared by the looping jobs; `None` for one-shot commands.
    #[must_use]
    pub fn service(&self) -> Option<&ServiceArgs> {
        match self {
            Self::Feed2catalog { service, .. }
            | Self::Catalog2search { service, .. }
            | Self::Monitor { service } => Some(service),
            Self::Backfill { .. } => None,
        }
    }

    /// Feed-to-catalog settings, if this is the `feed2catalog` command.
    #[must_use]
    pub fn sync_config(&self) -> Option<SyncConfig> {
        let Self::Feed2catalog {
            top,
            skip_created,
            start_date,
            delete_lookback_secs,
            commit_spacing_ms,
            ..
        } = self
        else {
            return None;
        };
        Some(SyncConfig {
            top: *top,
            skip_created: *skip_created,
            start_date: *start_date,
            delete_lookback: Duration::from_secs(*delete_lookback_secs),
            commit_spacing: Duration::from_millis(*commit_spacing_ms),
            ..SyncConfig::default()
        })
    }

    /// Publication settings, if this is the `catalog2search` command.
    #[must_use]
    pub fn catalog2search_config(&self) -> Option<Catalog2SearchConfig> {
        match self {
            Self::Catalog2search {
                batch_size,
                max_commits_per_pass,
                ..
            } => Some(Catalog2SearchConfig {
                batch_size: *batch_size,
                max_commits_per_pass: *max_commits_per_pass,
            }),
            _ => None,
        }
    }

    /// Export settings, if this is the `backfill` command.
    #[must_use]
    pub fn export_config(&self) -> Option<ExportConfig> {
        match self {
            Self::Backfill {
                keys_per_range,
                batch_size,
                parallelism,
            } => Some(ExportConfig {
                keys_per_range: *keys_per_range,
                batch_size: *batch_size,
                parallelism: *parallelism,
            }),
            _ => None,
        }
    }
}
