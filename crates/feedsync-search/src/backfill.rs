//! Initial population of the search indexes from the full catalog.
//!
//! A backfill reads the latest state of every identity in the catalog,
//! exports both logical indexes over key ranges, writes the version lists,
//! and finally creates the publication cursor at the last catalog commit.
//! Catalog2Search then continues from that cursor as if it had published
//! every commit itself.
//!
//! A backfill only runs against an empty state scope: an existing cursor
//! means publication already started, and the backfill refuses to run.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use feedsync_catalog::{CatalogCommitItem, CatalogReader};
use feedsync_core::{PackageId, PackageIdentity, ScopedStorage};

use crate::builder::{hijack_action, search_action};
use crate::catalog2search::{CURSOR_PATH, latest_per_identity, load_cursor, save_cursor};
use crate::error::{Result, SearchError};
use crate::export::{ExportConfig, ExportSource, ExportSummary, KeyRange, export};
use crate::index::{IndexAction, LogicalIndex, SearchIndexClient};
use crate::version_list::{VersionListData, VersionListDataClient};

/// Live versions of one package id, in catalog order.
#[derive(Debug, Clone)]
struct PackageVersions {
    package_id: PackageId,
    versions: Vec<(PackageIdentity, bool)>,
}

impl PackageVersions {
    fn version_list(&self) -> VersionListData {
        let mut data = VersionListData::default();
        for (identity, listed) in &self.versions {
            data.upsert(identity.version.key(), *listed);
        }
        data
    }
}

/// Latest state of every live package in the catalog.
#[derive(Debug, Clone)]
pub struct ExportSnapshot {
    packages: Arc<Vec<PackageVersions>>,
    last_commit: Option<DateTime<Utc>>,
}

impl ExportSnapshot {
    /// Reads the whole catalog and keeps the latest item of each identity.
    /// Deleted identities are dropped.
    ///
    /// # Errors
    ///
    /// Returns a catalog error if the root or a leaf cannot be read.
    pub async fn load(reader: &CatalogReader) -> Result<Self> {
        let items = reader.items_since(None).await?;
        let last_commit = items.last().map(CatalogCommitItem::commit_timestamp);

        let mut packages: BTreeMap<String, PackageVersions> = BTreeMap::new();
        for item in latest_per_identity(items) {
            if item.is_delete() {
                continue;
            }
            let leaf = reader.read_leaf(&item).await?;
            let listed = leaf
                .get("listed")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(true);

            let package_id = &item.identity().id;
            packages
                .entry(package_id.key().to_string())
                .or_insert_with(|| PackageVersions {
                    package_id: package_id.clone(),
                    versions: Vec::new(),
                })
                .versions
                .push((item.identity().clone(), listed));
        }

        Ok(Self {
            packages: Arc::new(packages.into_values().collect()),
            last_commit,
        })
    }

    /// Commit timestamp of the newest catalog commit read.
    #[must_use]
    pub fn last_commit(&self) -> Option<DateTime<Utc>> {
        self.last_commit
    }

    /// Number of package ids with at least one live version.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Returns true if the catalog holds no live version.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// An export source producing the documents of `index`.
    #[must_use]
    pub fn source(&self, index: LogicalIndex) -> CatalogExportSource {
        CatalogExportSource {
            packages: Arc::clone(&self.packages),
            index,
        }
    }
}

/// [`ExportSource`] over an [`ExportSnapshot`]. Keys are package id
/// positions in the snapshot, so a range never splits the versions of one
/// package id.
#[derive(Debug, Clone)]
pub struct CatalogExportSource {
    packages: Arc<Vec<PackageVersions>>,
    index: LogicalIndex,
}

#[async_trait]
impl ExportSource for CatalogExportSource {
    async fn keys(&self) -> Result<Vec<u64>> {
        (0..self.packages.len())
            .map(|position| {
                u64::try_from(position).map_err(|_| SearchError::Invariant {
                    message: format!("package position {position} does not fit a key"),
                })
            })
            .collect()
    }

    async fn documents(&self, range: KeyRange) -> Result<Vec<IndexAction>> {
        let mut actions = Vec::new();
        for (position, package) in self.packages.iter().enumerate() {
            let in_range = u64::try_from(position).is_ok_and(|key| range.contains(key));
            if !in_range {
                continue;
            }
            match self.index {
                LogicalIndex::Search => {
                    let data = package.version_list();
                    if data.listed_count() > 0 {
                        actions.push(search_action(&package.package_id, &data));
                    }
                }
                LogicalIndex::Hijack => actions.extend(
                    package
                        .versions
                        .iter()
                        .map(|(identity, listed)| hijack_action(identity, *listed)),
                ),
            }
        }
        Ok(actions)
    }
}

/// What a backfill wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Package ids with at least one live version.
    pub packages: usize,
    /// Export into the search index.
    pub search: ExportSummary,
    /// Export into the hijack index.
    pub hijack: ExportSummary,
    /// Version lists written.
    pub version_lists: usize,
    /// Cursor created, if the backfill completed.
    pub cursor: Option<DateTime<Utc>>,
}

/// Populates both indexes and the version lists from the whole catalog,
/// then creates the publication cursor in `state`.
///
/// A cancelled backfill leaves the cursor missing, so it can be run again.
///
/// # Errors
///
/// Returns `SearchError::CursorConflict` if the cursor already exists, or
/// the first catalog, export, or version list error.
pub async fn backfill(
    catalog: &CatalogReader,
    state: &ScopedStorage,
    search: Arc<dyn SearchIndexClient>,
    hijack: Arc<dyn SearchIndexClient>,
    version_lists: Arc<dyn VersionListDataClient>,
    config: ExportConfig,
    cancel: &CancellationToken,
) -> Result<BackfillSummary> {
    if let (_, Some(version)) = load_cursor(state).await? {
        return Err(SearchError::CursorConflict {
            message: format!("{CURSOR_PATH} already exists at version {version}"),
        });
    }

    let snapshot = ExportSnapshot::load(catalog).await?;
    let mut summary = BackfillSummary {
        packages: snapshot.len(),
        ..BackfillSummary::default()
    };
    tracing::info!(
        packages = summary.packages,
        last_commit = ?snapshot.last_commit(),
        "starting backfill"
    );

    summary.hijack = export(
        Arc::new(snapshot.source(LogicalIndex::Hijack)),
        hijack,
        config,
        cancel,
    )
    .await?;
    summary.search = export(
        Arc::new(snapshot.source(LogicalIndex::Search)),
        search,
        config,
        cancel,
    )
    .await?;
    if cancel.is_cancelled() || summary.hijack.skipped > 0 || summary.search.skipped > 0 {
        tracing::warn!("backfill cancelled before the cursor was created");
        return Ok(summary);
    }

    for package in snapshot.packages.iter() {
        let current = version_lists.read(&package.package_id).await?;
        let mut data = current.result;
        for (identity, listed) in &package.versions {
            data.upsert(identity.version.key(), *listed);
        }
        version_lists
            .replace(&package.package_id, &data, &current.access_condition)
            .await?;
        summary.version_lists += 1;
    }

    if let Some(last_commit) = snapshot.last_commit() {
        save_cursor(state, last_commit, None).await?;
        summary.cursor = Some(last_commit);
    }

    tracing::info!(
        packages = summary.packages,
        search_actions = summary.search.actions,
        hijack_actions = summary.hijack.actions,
        version_lists = summary.version_lists,
        cursor = ?summary.cursor,
        "backfill complete"
    );
    Ok(summary)
}
