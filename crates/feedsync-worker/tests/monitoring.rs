//! Integration tests for the monitoring queue processor.
//!
//! A feed-to-catalog run fills the catalog; validation requests then go
//! through a storage queue and statuses land in a separate scope of the same
//! tracing backend.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use feedsync_catalog::{CatalogReader, Feed2Catalog, SyncConfig};
use feedsync_core::PackageIdentity;
use feedsync_test_utils::{ScriptedFeed, StaticAuditSource, TestContext, at, identity, package};
use feedsync_worker::monitoring::{
    CatalogEntry, CatalogLeafValidator, MonitoringProcessor, PackageMonitoringStatus, PackageState,
    PackageValidatorContext, ProcessSummary, StatusStore, StorageQueue,
};

struct Harness {
    ctx: TestContext,
    queue: Arc<StorageQueue>,
    statuses: StatusStore,
    processor: MonitoringProcessor,
}

impl Harness {
    async fn with_catalog(feed: ScriptedFeed) -> Self {
        let ctx = TestContext::new();
        let config = SyncConfig {
            start_date: Some(at(0)),
            commit_spacing: Duration::ZERO,
            ..SyncConfig::default()
        };
        Feed2Catalog::new(
            ctx.catalog.clone(),
            Arc::new(feed),
            Arc::new(StaticAuditSource::default()),
            config,
        )
        .run(&CancellationToken::new())
        .await
        .expect("feed2catalog");

        let queue = Arc::new(StorageQueue::new(ctx.scope("queue")));
        let statuses = StatusStore::new(ctx.scope("monitoring"));
        let processor = MonitoringProcessor::new(
            queue.clone(),
            Arc::new(CatalogLeafValidator::new(ctx.catalog.clone())),
            statuses.clone(),
            ctx.catalog.clone(),
        );
        Self {
            ctx,
            queue,
            statuses,
            processor,
        }
    }

    async fn catalog_entries(&self, package: &PackageIdentity) -> Vec<CatalogEntry> {
        CatalogReader::new(self.ctx.catalog.clone())
            .items_since(None)
            .await
            .expect("items")
            .iter()
            .filter(|item| item.identity() == package)
            .map(CatalogEntry::from)
            .collect()
    }

    async fn enqueue(&self, package: PackageIdentity, catalog_entries: Vec<CatalogEntry>) {
        self.queue
            .enqueue(&PackageValidatorContext {
                package,
                catalog_entries,
            })
            .await
            .expect("enqueue");
    }

    async fn drain(&self) -> ProcessSummary {
        self.processor
            .process_all(&CancellationToken::new())
            .await
            .expect("process")
    }

    async fn status(&self, package: &PackageIdentity) -> Option<PackageMonitoringStatus> {
        self.statuses.get(package).await.expect("status")
    }
}

fn two_packages() -> ScriptedFeed {
    ScriptedFeed::with_packages([
        package("Contoso.Core", "1.0.0", at(1)),
        package("Contoso.Web", "2.0.0", at(2)),
    ])
}

#[tokio::test]
async fn valid_packages_are_recorded_and_removed() {
    let harness = Harness::with_catalog(two_packages()).await;
    let core = identity("Contoso.Core", "1.0.0");
    let web = identity("Contoso.Web", "2.0.0");

    harness.enqueue(core.clone(), Vec::new()).await;
    let entries = harness.catalog_entries(&web).await;
    harness.enqueue(web.clone(), entries.clone()).await;

    let summary = harness.drain().await;
    assert_eq!(summary.validated, 2);
    assert_eq!(summary.handled(), 2);
    assert!(harness.queue.is_empty().await.expect("len"));

    let core_status = harness.status(&core).await.expect("core status");
    assert_eq!(core_status.state, PackageState::Valid);
    assert!(core_status.errors.is_empty());
    assert_eq!(
        core_status.catalog_entries,
        harness.catalog_entries(&core).await,
        "entries are looked up in the catalog when the message has none"
    );

    let web_status = harness.status(&web).await.expect("web status");
    assert_eq!(web_status.state, PackageState::Valid);
    assert_eq!(web_status.catalog_entries, entries);
}

#[tokio::test]
async fn catalog_behind_the_request_is_invalid() {
    let harness = Harness::with_catalog(two_packages()).await;
    let core = identity("Contoso.Core", "1.0.0");
    let ahead = CatalogEntry {
        commit_id: "not-yet-committed".into(),
        commit_timestamp: Utc::now() + chrono::Duration::days(1),
    };
    harness.enqueue(core.clone(), vec![ahead]).await;

    let summary = harness.drain().await;
    assert_eq!(summary.validated, 1);

    let status = harness.status(&core).await.expect("status");
    assert_eq!(status.state, PackageState::Invalid);
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].contains("behind"));
}

#[tokio::test]
async fn older_requests_are_skipped_when_a_newer_status_exists() {
    let harness = Harness::with_catalog(two_packages()).await;
    let core = identity("Contoso.Core", "1.0.0");
    let newer = PackageMonitoringStatus {
        package: core.clone(),
        state: PackageState::Invalid,
        catalog_entries: vec![CatalogEntry {
            commit_id: "later".into(),
            commit_timestamp: Utc::now() + chrono::Duration::days(1),
        }],
        errors: vec!["recorded earlier".into()],
        recorded_at: Utc::now(),
    };
    harness.statuses.put(&newer).await.expect("seed status");

    let entries = harness.catalog_entries(&core).await;
    harness.enqueue(core.clone(), entries).await;

    let summary = harness.drain().await;
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.validated, 0);
    assert!(harness.queue.is_empty().await.expect("len"), "skipped messages are removed");
    assert_eq!(harness.status(&core).await, Some(newer));
}

#[tokio::test]
async fn packages_missing_from_the_catalog_get_a_failed_status() {
    let harness = Harness::with_catalog(two_packages()).await;
    let missing = identity("Fabrikam.Gone", "3.0.0");
    harness.enqueue(missing.clone(), Vec::new()).await;

    let summary = harness.drain().await;
    assert_eq!(summary.failed, 1);
    assert!(harness.queue.is_empty().await.expect("len"));

    let status = harness.status(&missing).await.expect("status");
    assert_eq!(status.state, PackageState::Failed);
    assert_eq!(status.errors.len(), 1);
}

#[tokio::test]
async fn messages_stay_queued_when_no_status_can_be_recorded() {
    let harness = Harness::with_catalog(two_packages()).await;
    let missing = identity("Fabrikam.Gone", "3.0.0");
    harness.enqueue(missing.clone(), Vec::new()).await;
    harness.ctx.storage.inject_write_failure("monitoring/");

    let summary = harness.drain().await;
    assert_eq!(summary.unremoved, 1);
    assert_eq!(summary.handled(), 0);
    assert_eq!(harness.queue.len().await.expect("len"), 1);

    harness.ctx.storage.clear_failures();
    let retry = harness.drain().await;
    assert_eq!(retry.failed, 1);
    assert!(harness.queue.is_empty().await.expect("len"));
    assert_eq!(
        harness.status(&missing).await.map(|s| s.state),
        Some(PackageState::Failed)
    );
}
