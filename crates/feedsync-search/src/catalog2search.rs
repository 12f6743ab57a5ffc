//! Catalog-to-search publication.
//!
//! A pass reads the commit items after a persisted cursor, keeps the latest
//! item per identity, groups them by package id, and publishes them through
//! one [`BatchPusher`]. The cursor advances only after the pusher finished, so
//! a failed pass is repeated from the same cursor.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use feedsync_catalog::{CatalogCommitItem, CatalogReader};
use feedsync_core::observability::sync_span;
use feedsync_core::{PackageId, ScopedStorage, WritePrecondition, WriteResult};

use crate::batch_pusher::{BatchPusher, BatchPusherConfig, DEFAULT_BATCH_SIZE, PushSummary};
use crate::builder::{DefaultIndexActionBuilder, IndexActionBuilder, VersionChange};
use crate::error::{Result, SearchError};
use crate::index::SearchIndexClient;
use crate::metrics;
use crate::version_list::VersionListDataClient;

/// Cursor document path within the state scope.
pub const CURSOR_PATH: &str = "cursors/catalog2search.json";

/// Configuration for the publication pass.
#[derive(Debug, Clone, Copy)]
pub struct Catalog2SearchConfig {
    /// Maximum actions per index batch.
    pub batch_size: usize,
    /// Maximum catalog commits published per pass.
    pub max_commits_per_pass: usize,
}

impl Default for Catalog2SearchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_commits_per_pass: 100,
        }
    }
}

/// Persisted publication position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationCursor {
    /// Commit timestamp of the last published commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<DateTime<Utc>>,
}

/// What a pass (or several) published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Catalog commits published.
    pub commits: usize,
    /// Catalog items published, after keeping the latest per identity.
    pub items: usize,
    /// Package ids enqueued.
    pub packages: usize,
    /// Index batches and version lists pushed.
    pub push: PushSummary,
}

impl std::ops::AddAssign for PassSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.commits += rhs.commits;
        self.items += rhs.items;
        self.packages += rhs.packages;
        self.push += rhs.push;
    }
}

/// The catalog-to-search job.
pub struct Catalog2Search {
    reader: CatalogReader,
    state: ScopedStorage,
    search: Arc<dyn SearchIndexClient>,
    hijack: Arc<dyn SearchIndexClient>,
    version_lists: Arc<dyn VersionListDataClient>,
    builder: Arc<dyn IndexActionBuilder>,
    config: Catalog2SearchConfig,
    pass: u64,
}

impl std::fmt::Debug for Catalog2Search {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog2Search")
            .field("config", &self.config)
            .field("pass", &self.pass)
            .finish_non_exhaustive()
    }
}

impl Catalog2Search {
    /// Creates the job. The cursor lives in `state`.
    #[must_use]
    pub fn new(
        catalog: ScopedStorage,
        state: ScopedStorage,
        search: Arc<dyn SearchIndexClient>,
        hijack: Arc<dyn SearchIndexClient>,
        version_lists: Arc<dyn VersionListDataClient>,
        config: Catalog2SearchConfig,
    ) -> Self {
        Self {
            reader: CatalogReader::new(catalog),
            state,
            search,
            hijack,
            builder: Arc::new(DefaultIndexActionBuilder::new(version_lists.clone())),
            version_lists,
            config,
            pass: 0,
        }
    }

    /// Replaces the index action builder.
    #[must_use]
    pub fn with_builder(mut self, builder: Arc<dyn IndexActionBuilder>) -> Self {
        self.builder = builder;
        self
    }

    /// Reads the persisted cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be read or parsed.
    pub async fn cursor(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.load_cursor().await?.0.value)
    }

    /// Runs passes until one publishes nothing or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the first pass error.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<PassSummary> {
        let mut total = PassSummary::default();
        loop {
            let summary = self.run_pass(cancel).await?;
            total += summary;
            if summary.commits == 0 || cancel.is_cancelled() {
                return Ok(total);
            }
        }
    }

    /// Publishes up to `max_commits_per_pass` commits after the cursor.
    ///
    /// # Errors
    ///
    /// Returns catalog, builder, pusher, or cursor errors. The cursor is left
    /// unchanged on error.
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> Result<PassSummary> {
        self.pass += 1;
        let span = sync_span("catalog2search", self.pass);
        self.pass_inner(cancel).instrument(span).await
    }

    async fn pass_inner(&self, cancel: &CancellationToken) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        let (cursor, cursor_version) = self.load_cursor().await?;
        if cancel.is_cancelled() {
            return Ok(summary);
        }

        let items = self.reader.items_since(cursor.value).await?;
        let (commits, items) = take_commits(items, self.config.max_commits_per_pass);
        let Some(next) = items.last().map(CatalogCommitItem::commit_timestamp) else {
            tracing::debug!("no catalog commits to publish");
            return Ok(summary);
        };
        summary.commits = commits;

        let latest = latest_per_identity(items);
        summary.items = latest.len();
        let packages = self.group_by_package_id(latest, cancel).await?;
        if cancel.is_cancelled() {
            return Ok(PassSummary::default());
        }
        summary.packages = packages.len();

        let mut pusher = BatchPusher::new(
            self.search.clone(),
            self.hijack.clone(),
            self.version_lists.clone(),
            BatchPusherConfig {
                batch_size: self.config.batch_size,
            },
        );
        for (package_id, changes) in packages.values() {
            let actions = self.builder.build(package_id, changes).await?;
            pusher.enqueue(package_id, actions)?;
            summary.push += pusher.push_full_batches().await?;
        }
        summary.push += pusher.finish().await?;

        save_cursor(&self.state, next, cursor_version).await?;
        metrics::record_items_published(summary.items);
        tracing::info!(
            commits = summary.commits,
            items = summary.items,
            packages = summary.packages,
            batches = summary.push.batches,
            version_lists = summary.push.version_lists,
            cursor = %next.to_rfc3339(),
            "published catalog commits"
        );
        Ok(summary)
    }

    async fn group_by_package_id(
        &self,
        items: Vec<CatalogCommitItem>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, (PackageId, Vec<VersionChange>)>> {
        let mut packages: BTreeMap<String, (PackageId, Vec<VersionChange>)> = BTreeMap::new();
        for item in items {
            if cancel.is_cancelled() {
                break;
            }

            let change = if item.is_delete() {
                VersionChange::delete(item.identity().clone())
            } else {
                let leaf = self.reader.read_leaf(&item).await?;
                let listed = leaf
                    .get("listed")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true);
                VersionChange::upsert(item.identity().clone(), listed)
            };

            let package_id = &item.identity().id;
            packages
                .entry(package_id.key().to_string())
                .or_insert_with(|| (package_id.clone(), Vec::new()))
                .1
                .push(change);
        }
        Ok(packages)
    }

    async fn load_cursor(&self) -> Result<(PublicationCursor, Option<String>)> {
        load_cursor(&self.state).await
    }
}

/// Reads the cursor in `state` with its version; a missing cursor is empty.
pub(crate) async fn load_cursor(
    state: &ScopedStorage,
) -> Result<(PublicationCursor, Option<String>)> {
    let Some(meta) = state.head_raw(CURSOR_PATH).await? else {
        return Ok((PublicationCursor::default(), None));
    };
    let bytes = state.get_raw(CURSOR_PATH).await?;
    let cursor = serde_json::from_slice(&bytes)?;
    Ok((cursor, Some(meta.version)))
}

/// Writes the cursor if it is still at `version` (or still missing).
pub(crate) async fn save_cursor(
    state: &ScopedStorage,
    value: DateTime<Utc>,
    version: Option<String>,
) -> Result<()> {
    let bytes = serde_json::to_vec(&PublicationCursor { value: Some(value) })?;
    let precondition = match version {
        Some(version) => WritePrecondition::MatchesVersion(version),
        None => WritePrecondition::DoesNotExist,
    };

    match state.put_raw(CURSOR_PATH, bytes.into(), precondition).await? {
        WriteResult::Success { .. } => Ok(()),
        WriteResult::PreconditionFailed { current_version } => Err(SearchError::CursorConflict {
            message: format!("cursor moved to version {current_version} during the pass"),
        }),
    }
}

/// Keeps the items of the first `max_commits` commits of sorted `items`.
/// Returns the number of commits kept and their items.
fn take_commits(items: Vec<CatalogCommitItem>, max_commits: usize) -> (usize, Vec<CatalogCommitItem>) {
    let mut commits = 0;
    let mut last: Option<DateTime<Utc>> = None;
    let mut kept = Vec::new();
    for item in items {
        if last != Some(item.commit_timestamp()) {
            if commits == max_commits.max(1) {
                break;
            }
            commits += 1;
            last = Some(item.commit_timestamp());
        }
        kept.push(item);
    }
    (commits, kept)
}

/// Keeps the last item of each identity in sorted `items`.
pub(crate) fn latest_per_identity(items: Vec<CatalogCommitItem>) -> Vec<CatalogCommitItem> {
    let mut latest: BTreeMap<String, CatalogCommitItem> = BTreeMap::new();
    for item in items {
        latest.insert(item.identity().key(), item);
    }
    let mut items: Vec<_> = latest.into_values().collect();
    items.sort();
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use feedsync_catalog::CatalogItemType;
    use feedsync_core::PackageIdentity;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).single().expect("valid") + Duration::seconds(seconds)
    }

    fn item(id: &str, version: &str, seconds: i64, kind: CatalogItemType) -> CatalogCommitItem {
        CatalogCommitItem::new(
            format!("data/{id}.{version}.json"),
            format!("commit-{seconds}"),
            at(seconds),
            [kind],
            PackageIdentity::new(id, version).expect("identity"),
        )
        .expect("item")
    }

    #[test]
    fn take_commits_keeps_whole_commits() {
        let items = vec![
            item("A", "1.0.0", 1, CatalogItemType::PackageDetails),
            item("B", "1.0.0", 1, CatalogItemType::PackageDetails),
            item("C", "1.0.0", 2, CatalogItemType::PackageDetails),
            item("D", "1.0.0", 3, CatalogItemType::PackageDetails),
        ];

        let (commits, kept) = take_commits(items, 2);
        assert_eq!(commits, 2);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept.last().map(CatalogCommitItem::commit_timestamp), Some(at(2)));
    }

    #[test]
    fn latest_item_per_identity_wins() {
        let items = vec![
            item("A", "1.0.0", 1, CatalogItemType::PackageDetails),
            item("a", "1.0.0", 2, CatalogItemType::PackageDelete),
            item("A", "2.0.0", 3, CatalogItemType::PackageDetails),
        ];

        let latest = latest_per_identity(items);
        assert_eq!(latest.len(), 2);
        assert!(latest[0].is_delete());
        assert_eq!(latest[1].identity().version.as_str(), "2.0.0");
    }
}
