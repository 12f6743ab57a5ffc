//! Integration tests for the feed-to-catalog cycle.
//!
//! These run the full deletes / creates / edits iteration against in-memory
//! storage and a scripted feed, then inspect what the catalog published.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use feedsync_catalog::{
    CatalogError, CatalogItemType, CatalogReader, ChangeKind, Feed2Catalog, SyncConfig, Watermark,
};
use feedsync_test_utils::{
    ScriptedFeed, StaticAuditSource, TestContext, at, deletion, edited_package, package,
};

fn config() -> SyncConfig {
    SyncConfig {
        commit_spacing: Duration::ZERO,
        ..SyncConfig::default()
    }
}

fn job(
    ctx: &TestContext,
    feed: &ScriptedFeed,
    audit: &StaticAuditSource,
    config: SyncConfig,
) -> Feed2Catalog {
    Feed2Catalog::new(
        ctx.catalog.clone(),
        Arc::new(feed.clone()),
        Arc::new(audit.clone()),
        config,
    )
}

#[tokio::test]
async fn creates_are_committed_with_the_watermark() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::with_packages([
        package("A", "1.0.0", at(1)),
        package("B", "1.0.0", at(2)),
        package("C", "2.0.0", at(2)),
    ]);
    let audit = StaticAuditSource::default();
    let mut job = job(&ctx, &feed, &audit, config());

    let counts = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect("iteration");
    assert_eq!(counts.created, 3);
    assert_eq!(counts.edited, 0);
    assert_eq!(counts.deleted, 0);

    let reader = CatalogReader::new(ctx.catalog.clone());
    let watermark = reader.watermark().await.expect("watermark");
    assert_eq!(watermark.last_created, Some(at(2)));

    let items = reader.items_since(None).await.expect("items");
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|i| i.is(CatalogItemType::PackageDetails)));
    let commits: BTreeSet<_> = items.iter().map(|i| i.commit_id().to_string()).collect();
    assert_eq!(commits.len(), 1, "one commit per phase");

    let leaf = reader.read_leaf(&items[0]).await.expect("leaf");
    assert_eq!(leaf["id"], "A");
}

#[tokio::test]
async fn run_pages_through_the_feed_and_stops_when_idle() {
    let ctx = TestContext::new();
    let feed =
        ScriptedFeed::with_packages((1..=5).map(|n| package(&format!("P{n}"), "1.0.0", at(n))));
    let audit = StaticAuditSource::default();
    let mut job = job(
        &ctx,
        &feed,
        &audit,
        SyncConfig {
            top: 2,
            ..config()
        },
    );

    let total = job.run(&CancellationToken::new()).await.expect("run");
    assert_eq!(total.created, 5);

    let reader = CatalogReader::new(ctx.catalog.clone());
    assert_eq!(reader.items_since(None).await.expect("items").len(), 5);
    assert_eq!(
        reader.watermark().await.expect("watermark").last_created,
        Some(at(5))
    );

    // Running again finds nothing new and writes nothing.
    ctx.storage.clear_operations();
    let again = job.run(&CancellationToken::new()).await.expect("run");
    assert_eq!(again.total(), 0);
    assert!(ctx.storage.puts().is_empty());
}

#[tokio::test]
async fn repeated_delete_is_split_across_commits() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::new();
    let audit = StaticAuditSource::new([
        deletion("A", "1.0.0", at(5)),
        deletion("B", "1.0.0", at(6)),
        deletion("A", "1.0.0", at(7)),
    ]);
    let mut job = job(
        &ctx,
        &feed,
        &audit,
        SyncConfig {
            start_date: Some(at(0)),
            ..config()
        },
    );

    let counts = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect("iteration");
    assert_eq!(counts.deleted, 3);

    let reader = CatalogReader::new(ctx.catalog.clone());
    let items = reader.items_since(None).await.expect("items");
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|i| i.is_delete()));

    let commits: BTreeSet<_> = items.iter().map(|i| i.commit_id().to_string()).collect();
    assert_eq!(commits.len(), 2);

    let watermark = reader.watermark().await.expect("watermark");
    assert_eq!(watermark.last_deleted, Some(at(7)));
    assert_eq!(watermark.last_created, Some(at(0)));
}

#[tokio::test]
async fn same_timestamp_delete_of_one_identity_gets_two_commits() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::new();
    let audit = StaticAuditSource::new([
        deletion("A", "1.0.0", at(5)),
        deletion("A", "1.0.0", at(5)),
    ]);
    let mut job = job(
        &ctx,
        &feed,
        &audit,
        SyncConfig {
            start_date: Some(at(0)),
            ..config()
        },
    );

    let counts = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect("iteration");
    assert_eq!(counts.deleted, 2);

    let reader = CatalogReader::new(ctx.catalog.clone());
    let items = reader.items_since(None).await.expect("items");
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.is_delete()));
    assert_ne!(items[0].commit_id(), items[1].commit_id());
    assert!(items[0].commit_timestamp() < items[1].commit_timestamp());

    let leaves = ctx
        .storage
        .paths()
        .into_iter()
        .filter(|p| p.starts_with("catalog/data/"))
        .count();
    assert_eq!(leaves, 2, "each commit writes its own leaf");
    assert_eq!(
        ctx.storage.version("catalog/index.json").as_deref(),
        Some("2"),
        "one root CAS per commit"
    );

    let watermark = reader.watermark().await.expect("watermark");
    assert_eq!(watermark.last_deleted, Some(at(5)));
}

#[tokio::test]
async fn failed_delete_segment_keeps_earlier_commits_counted() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::new();
    let audit = StaticAuditSource::new([
        deletion("A", "1.0.0", at(5)),
        deletion("A", "1.0.0", at(6)),
    ]);
    let mut job = job(
        &ctx,
        &feed,
        &audit,
        SyncConfig {
            start_date: Some(at(0)),
            commit_spacing: Duration::from_millis(200),
            ..config()
        },
    );

    // Fail the root write once the first segment is published.
    let storage = ctx.storage.clone();
    let injector = tokio::spawn(async move {
        while !storage.puts().iter().any(|p| p == "catalog/index.json") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        storage.inject_write_failure("catalog/index.json");
    });

    let err = job
        .run(&CancellationToken::new())
        .await
        .expect_err("second segment fails");
    injector.await.expect("injector");
    assert!(matches!(err, CatalogError::Storage { .. }));
    assert_eq!(job.committed().deleted, 1);

    let reader = CatalogReader::new(ctx.catalog.clone());
    assert_eq!(
        reader.watermark().await.expect("watermark").last_deleted,
        Some(at(5))
    );
    assert_eq!(reader.items_since(None).await.expect("items").len(), 1);

    ctx.storage.clear_failures();
    let retry = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect("retry");
    assert_eq!(retry.deleted, 1);
    assert_eq!(job.committed().deleted, 2);
    assert_eq!(
        reader.watermark().await.expect("watermark").last_deleted,
        Some(at(6))
    );
}

#[tokio::test]
async fn unreadable_catalog_root_fails_before_any_write() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::with_packages([package("A", "1.0.0", at(1))]);
    let audit = StaticAuditSource::default();
    let mut job = job(&ctx, &feed, &audit, config());

    ctx.storage.inject_failure("catalog/index.json");
    let err = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect_err("root read fails");
    assert!(matches!(err, CatalogError::Storage { .. }));
    assert!(!err.is_defect());
    assert!(ctx.storage.puts().is_empty());
    assert!(feed.queries().is_empty(), "the feed is not queried");
    assert_eq!(job.committed().total(), 0);
}

#[tokio::test]
async fn deletes_wait_until_a_watermark_exists() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::with_packages([package("A", "1.0.0", at(10))]);
    let audit = StaticAuditSource::new([deletion("Old", "1.0.0", at(3))]);
    let mut job = job(&ctx, &feed, &audit, config());

    let first = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect("iteration");
    assert_eq!(first.deleted, 0, "no lastDeleted yet, so deletes are skipped");
    assert_eq!(first.created, 1);

    // The next iteration resolves lastDeleted from lastCreated; older
    // deletions stay behind it.
    audit.extend([deletion("A", "1.0.0", at(11))]);
    let second = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect("iteration");
    assert_eq!(second.deleted, 1);
}

#[tokio::test]
async fn skip_created_lets_edits_carry_last_created() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::with_packages([edited_package("A", "1.0.0", at(1), at(4))]);
    let audit = StaticAuditSource::default();
    let mut job = job(
        &ctx,
        &feed,
        &audit,
        SyncConfig {
            skip_created: true,
            ..config()
        },
    );

    let counts = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect("iteration");
    assert_eq!(counts.created, 0);
    assert_eq!(counts.edited, 1);
    assert!(
        feed.queries()
            .iter()
            .all(|(kind, _)| *kind == ChangeKind::Edited)
    );

    let watermark = CatalogReader::new(ctx.catalog.clone())
        .watermark()
        .await
        .expect("watermark");
    assert_eq!(watermark.last_edited, Some(at(4)));
    assert_eq!(watermark.last_created, Some(at(4)));
}

#[tokio::test]
async fn failed_commit_leaves_watermark_unchanged() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::with_packages([package("A", "1.0.0", at(1))]);
    let audit = StaticAuditSource::default();
    let mut job = job(&ctx, &feed, &audit, config());

    ctx.storage.inject_write_failure("catalog/index.json");
    let err = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect_err("root write fails");
    assert!(matches!(err, CatalogError::Storage { .. }));
    assert!(!err.is_defect());

    let reader = CatalogReader::new(ctx.catalog.clone());
    assert_eq!(reader.watermark().await.expect("watermark"), Watermark::default());
    assert!(reader.items_since(None).await.expect("items").is_empty());

    ctx.storage.clear_failures();
    let counts = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect("retry");
    assert_eq!(counts.created, 1);
    assert_eq!(reader.items_since(None).await.expect("items").len(), 1);
}

#[tokio::test]
async fn feed_failure_surfaces_without_committing() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::with_packages([package("A", "1.0.0", at(1))]);
    feed.fail_next(1);
    let audit = StaticAuditSource::default();
    let mut job = job(&ctx, &feed, &audit, config());

    let err = job
        .run_iteration(&CancellationToken::new())
        .await
        .expect_err("feed down");
    assert!(matches!(err, CatalogError::Feed { .. }));
    assert!(ctx.storage.puts().is_empty());
}

#[tokio::test]
async fn cancelled_iteration_writes_nothing() {
    let ctx = TestContext::new();
    let feed = ScriptedFeed::with_packages([package("A", "1.0.0", at(1))]);
    let audit = StaticAuditSource::default();
    let mut job = job(&ctx, &feed, &audit, config());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let counts = job.run(&cancel).await.expect("run");
    assert_eq!(counts.total(), 0);
    assert!(ctx.storage.puts().is_empty());
}
