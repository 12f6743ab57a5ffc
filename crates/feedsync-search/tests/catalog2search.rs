//! Integration tests for catalog-to-search publication.
//!
//! A feed-to-catalog iteration fills the catalog, then the publication pass
//! pushes it to in-memory indexes while version lists and the cursor live in
//! the shared tracing backend.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use feedsync_catalog::{Feed2Catalog, SyncConfig};
use feedsync_core::PackageId;
use feedsync_search::{
    Catalog2Search, Catalog2SearchConfig, InMemorySearchIndex, LogicalIndex, SearchError,
    StorageVersionListClient, VersionListDataClient,
};
use feedsync_test_utils::{ScriptedFeed, StaticAuditSource, TestContext, at, deletion, package};

struct Pipeline {
    ctx: TestContext,
    feed: ScriptedFeed,
    audit: StaticAuditSource,
    search: Arc<InMemorySearchIndex>,
    hijack: Arc<InMemorySearchIndex>,
    version_lists: Arc<StorageVersionListClient>,
}

impl Pipeline {
    fn new(feed: ScriptedFeed) -> Self {
        let ctx = TestContext::new();
        let version_lists = Arc::new(StorageVersionListClient::new(ctx.state.clone()));
        Self {
            ctx,
            feed,
            audit: StaticAuditSource::default(),
            search: Arc::new(InMemorySearchIndex::new(LogicalIndex::Search)),
            hijack: Arc::new(InMemorySearchIndex::new(LogicalIndex::Hijack)),
            version_lists,
        }
    }

    async fn sync(&self, start: chrono::DateTime<Utc>) {
        let config = SyncConfig {
            start_date: Some(start),
            commit_spacing: Duration::ZERO,
            ..SyncConfig::default()
        };
        Feed2Catalog::new(
            self.ctx.catalog.clone(),
            Arc::new(self.feed.clone()),
            Arc::new(self.audit.clone()),
            config,
        )
        .run(&CancellationToken::new())
        .await
        .expect("feed2catalog");
    }

    fn publisher(&self, batch_size: usize) -> Catalog2Search {
        Catalog2Search::new(
            self.ctx.catalog.clone(),
            self.ctx.state.clone(),
            self.search.clone(),
            self.hijack.clone(),
            self.version_lists.clone(),
            Catalog2SearchConfig {
                batch_size,
                ..Catalog2SearchConfig::default()
            },
        )
    }

    fn version_list_writes(&self, id: &str) -> usize {
        let path = format!("state/version-lists/{}.json", id.to_lowercase());
        self.ctx
            .storage
            .puts()
            .iter()
            .filter(|p| **p == path)
            .count()
    }
}

#[tokio::test]
async fn new_item_flows_to_the_index_and_writes_its_version_list_once() {
    let pipeline = Pipeline::new(ScriptedFeed::with_packages([package(
        "Contoso.Lib",
        "1.0.0",
        at(1),
    )]));
    pipeline.sync(at(0)).await;

    let mut publisher = pipeline.publisher(10);
    let summary = publisher
        .run_pass(&CancellationToken::new())
        .await
        .expect("pass");

    assert_eq!(summary.commits, 1);
    assert_eq!(summary.items, 1);
    assert_eq!(summary.packages, 1);
    assert_eq!(summary.push.version_lists, 1);
    assert_eq!(pipeline.version_list_writes("Contoso.Lib"), 1);

    let document = pipeline.search.document("contoso.lib").expect("search doc");
    assert_eq!(document["latestVersion"], "1.0.0");
    assert!(pipeline.hijack.document("contoso.lib_1.0.0").is_some());

    let id = PackageId::new("Contoso.Lib").expect("id");
    let list = pipeline.version_lists.read(&id).await.expect("read");
    assert_eq!(list.result.listed_count(), 1);
    assert!(publisher.cursor().await.expect("cursor").is_some());
}

#[tokio::test]
async fn published_commits_are_not_published_again() {
    let pipeline = Pipeline::new(ScriptedFeed::with_packages([
        package("A", "1.0.0", at(1)),
        package("B", "1.0.0", at(2)),
    ]));
    pipeline.sync(at(0)).await;

    let mut publisher = pipeline.publisher(10);
    let cancel = CancellationToken::new();
    let first = publisher.run(&cancel).await.expect("run");
    assert_eq!(first.items, 2);

    let second = publisher.run(&cancel).await.expect("run");
    assert_eq!(second.commits, 0);
    assert_eq!(pipeline.version_list_writes("A"), 1);
    assert_eq!(pipeline.version_list_writes("B"), 1);
}

#[tokio::test]
async fn rejected_document_keeps_cursor_and_version_lists() {
    let pipeline = Pipeline::new(ScriptedFeed::with_packages([
        package("A", "1.0.0", at(1)),
        package("B", "1.0.0", at(1)),
    ]));
    pipeline.sync(at(0)).await;
    pipeline.search.reject("b");

    let mut publisher = pipeline.publisher(10);
    let err = publisher
        .run_pass(&CancellationToken::new())
        .await
        .expect_err("rejected");
    assert!(matches!(err, SearchError::IndexingFailed { .. }));
    assert!(!err.is_defect());
    assert_eq!(pipeline.version_list_writes("A"), 0);
    assert_eq!(pipeline.version_list_writes("B"), 0);
    assert_eq!(publisher.cursor().await.expect("cursor"), None);

    // The index accepts everything on the next attempt; nothing was skipped.
    let retry = Arc::new(InMemorySearchIndex::new(LogicalIndex::Search));
    let mut publisher = Catalog2Search::new(
        pipeline.ctx.catalog.clone(),
        pipeline.ctx.state.clone(),
        retry.clone(),
        pipeline.hijack.clone(),
        pipeline.version_lists.clone(),
        Catalog2SearchConfig::default(),
    );
    let summary = publisher
        .run_pass(&CancellationToken::new())
        .await
        .expect("retry");
    assert_eq!(summary.items, 2);
    assert!(retry.document("a").is_some());
    assert!(retry.document("b").is_some());
    assert_eq!(pipeline.version_list_writes("B"), 1);
}

#[tokio::test]
async fn deletes_remove_documents_and_versions() {
    let pipeline = Pipeline::new(ScriptedFeed::with_packages([package(
        "A",
        "1.0.0",
        at(1),
    )]));
    pipeline.sync(at(0)).await;

    let mut publisher = pipeline.publisher(10);
    let cancel = CancellationToken::new();
    publisher.run(&cancel).await.expect("publish create");
    assert_eq!(pipeline.search.len(), 1);

    pipeline.audit.extend([deletion("A", "1.0.0", at(30))]);
    pipeline.sync(at(0)).await;
    publisher.run(&cancel).await.expect("publish delete");

    assert!(pipeline.search.document("a").is_none());
    assert!(pipeline.hijack.document("a_1.0.0").is_none());
    let id = PackageId::new("A").expect("id");
    let list = pipeline.version_lists.read(&id).await.expect("read");
    assert!(list.result.version_properties.is_empty());
    assert_eq!(pipeline.version_list_writes("A"), 2);
}

#[tokio::test]
async fn unlisted_packages_are_not_in_the_search_document() {
    let mut unlisted = package("A", "2.0.0", at(2));
    unlisted.published = Some(Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).single().expect("valid"));
    assert_eq!(unlisted.published.map(|p| p.year()), Some(1900));

    let pipeline = Pipeline::new(ScriptedFeed::with_packages([
        package("A", "1.0.0", at(1)),
        unlisted,
    ]));
    pipeline.sync(at(0)).await;

    pipeline
        .publisher(10)
        .run(&CancellationToken::new())
        .await
        .expect("publish");

    let document = pipeline.search.document("a").expect("search doc");
    assert_eq!(document["latestVersion"], "1.0.0");
    assert_eq!(
        pipeline.hijack.document("a_2.0.0").expect("hijack doc")["listed"],
        false
    );
}

#[tokio::test]
async fn small_batches_still_write_each_version_list_once() {
    let pipeline = Pipeline::new(ScriptedFeed::with_packages(
        (1..=4).flat_map(|n| {
            [
                package("A", &format!("{n}.0.0"), at(n)),
                package("B", &format!("{n}.0.0"), at(n)),
            ]
        }),
    ));
    pipeline.sync(at(0)).await;

    let summary = pipeline
        .publisher(3)
        .run(&CancellationToken::new())
        .await
        .expect("publish");

    assert!(summary.push.batches >= 4);
    assert_eq!(pipeline.version_list_writes("A"), 1);
    assert_eq!(pipeline.version_list_writes("B"), 1);
    assert!(pipeline.hijack.batch_sizes().iter().all(|size| *size <= 3));
    assert_eq!(pipeline.search.document("a").expect("doc")["latestVersion"], "4.0.0");
}
