//! `feedsync-worker` entry point.
//!
//! Every looping subcommand builds one job over a file-backed storage root
//! and runs it behind a [`Runner`]. In service mode the health server and the
//! job loop share a cancellation token that fires on Ctrl-C; with `--once` the
//! job drains once and the process exits. `backfill` always runs once.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use feedsync_catalog::{CatalogReader, Feed2Catalog, HttpFeedClient, StorageAuditSource};
use feedsync_core::{FileBackend, ScopedStorage, StorageBackend, init_logging};
use feedsync_search::{
    Catalog2Search, LogicalIndex, StorageSearchIndex, StorageVersionListClient, backfill,
};
use feedsync_worker::config::{Cli, Command, ServiceArgs};
use feedsync_worker::monitoring::{
    CatalogLeafValidator, MonitoringProcessor, StatusStore, StorageQueue,
};
use feedsync_worker::runner::{Job, Runner, RunnerState, report_lag};
use feedsync_worker::{health, metrics};

const LAG_UPDATE_SECS: u64 = 30;

/// Storage scopes under the storage root.
struct Scopes {
    backend: Arc<dyn StorageBackend>,
}

impl Scopes {
    fn new(cli: &Cli) -> Self {
        Self {
            backend: Arc::new(FileBackend::new(cli.storage_root.clone())),
        }
    }

    fn scope(&self, name: &str) -> Result<ScopedStorage> {
        ScopedStorage::new(Arc::clone(&self.backend), name)
            .with_context(|| format!("failed to open storage scope '{name}'"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    metrics::init_metrics().map_err(|err| anyhow!("failed to install metrics recorder: {err}"))?;

    let scopes = Scopes::new(&cli);
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            on_signal.cancel();
        }
    });

    tracing::info!(
        job = cli.command.name(),
        storage_root = %cli.storage_root.display(),
        "starting worker"
    );

    let service_args = cli.command.service().cloned();
    let service = || {
        service_args
            .as_ref()
            .ok_or_else(|| anyhow!("{} takes no service options", cli.command.name()))
    };
    match &cli.command {
        Command::Feed2catalog {
            gallery,
            http_timeout_secs,
            ..
        } => {
            let feed = HttpFeedClient::new(gallery, Duration::from_secs(*http_timeout_secs))?;
            let audit = StorageAuditSource::new(scopes.scope("audit")?);
            let config = cli
                .command
                .sync_config()
                .ok_or_else(|| anyhow!("missing feed2catalog configuration"))?;
            let job = Feed2Catalog::new(
                scopes.scope("catalog")?,
                Arc::new(feed),
                Arc::new(audit),
                config,
            );
            serve(job, service()?, &cancel).await
        }

        Command::Catalog2search { .. } => {
            let config = cli
                .command
                .catalog2search_config()
                .ok_or_else(|| anyhow!("missing catalog2search configuration"))?;
            let search_scope = scopes.scope("search")?;
            let state = scopes.scope("state")?;
            let job = Catalog2Search::new(
                scopes.scope("catalog")?,
                state.clone(),
                Arc::new(StorageSearchIndex::new(search_scope.clone(), LogicalIndex::Search)),
                Arc::new(StorageSearchIndex::new(search_scope, LogicalIndex::Hijack)),
                Arc::new(StorageVersionListClient::new(state)),
                config,
            );
            serve(job, service()?, &cancel).await
        }

        Command::Backfill { .. } => {
            let config = cli
                .command
                .export_config()
                .ok_or_else(|| anyhow!("missing backfill configuration"))?;
            let search_scope = scopes.scope("search")?;
            let state = scopes.scope("state")?;
            let summary = backfill(
                &CatalogReader::new(scopes.scope("catalog")?),
                &state,
                Arc::new(StorageSearchIndex::new(search_scope.clone(), LogicalIndex::Search)),
                Arc::new(StorageSearchIndex::new(search_scope, LogicalIndex::Hijack)),
                Arc::new(StorageVersionListClient::new(state.clone())),
                config,
                &cancel,
            )
            .await?;
            tracing::info!(
                packages = summary.packages,
                version_lists = summary.version_lists,
                cursor = ?summary.cursor,
                "backfill finished"
            );
            Ok(())
        }

        Command::Monitor { .. } => {
            let catalog = scopes.scope("catalog")?;
            let job = MonitoringProcessor::new(
                Arc::new(StorageQueue::new(scopes.scope("queue")?)),
                Arc::new(CatalogLeafValidator::new(catalog.clone())),
                StatusStore::new(scopes.scope("monitoring")?),
                catalog,
            );
            serve(job, service()?, &cancel).await
        }
    }
}

/// Runs `job` once, or as a service with health endpoints until cancelled.
async fn serve<J: Job>(job: J, service: &ServiceArgs, cancel: &CancellationToken) -> Result<()> {
    let name = job.name();
    let config = service.runner_config();
    let state = Arc::new(RunnerState::new(config.unhealthy_threshold));
    let mut runner = Runner::new(job, config, Arc::clone(&state));

    if service.once {
        let items = runner.run_once(cancel).await?;
        tracing::info!(job = name, items, "single run complete");
        return Ok(());
    }

    tokio::spawn(report_lag(
        Arc::clone(&state),
        name,
        Duration::from_secs(LAG_UPDATE_SECS),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], service.port));
    tracing::info!(address = %addr, "starting health server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let router = health::router(state);
    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    let outcome = runner.run(cancel).await;
    cancel.cancel();
    server.await??;
    outcome?;

    tracing::info!(job = name, "worker stopped");
    Ok(())
}
