//! Append-only catalog writer.
//!
//! The critical invariants are:
//! - Items staged with [`AppendOnlyCatalogWriter::add`] become visible together
//!   or not at all: leaves and page versions are written under fresh paths
//!   with `DoesNotExist`, and the commit is published by a single CAS on
//!   `index.json`
//! - Commit timestamps strictly increase, and a watermark that would regress
//!   is rejected before anything is written
//! - A commit holds at most one item per identity

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, stream};
use serde_json::{Map, Value};
use tracing::Instrument;
use uuid::Uuid;

use feedsync_core::observability::commit_span;
use feedsync_core::{PackageIdentity, ScopedStorage, WritePrecondition, WriteResult};

use crate::commit_item::{CatalogCommitItem, CatalogItemType};
use crate::error::{CatalogError, Result};
use crate::manifest::{CatalogPage, CatalogRoot, PageEntry, PageRef, ROOT_FORMAT_VERSION, paths};
use crate::metrics;
use crate::reader::{json_bytes, load_root, read_json};
use crate::watermark::Watermark;

/// Default maximum number of entries per catalog page.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 550;

const LEAF_WRITE_CONCURRENCY: usize = 16;

/// An item staged for the next commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItem {
    /// Package the item describes.
    pub identity: PackageIdentity,
    /// Declared types; must not be empty.
    pub types: Vec<CatalogItemType>,
    /// Leaf document body. Catalog bookkeeping fields are added on commit.
    pub content: Map<String, Value>,
}

impl CatalogItem {
    /// Creates a package details item.
    #[must_use]
    pub fn details(identity: PackageIdentity, content: Map<String, Value>) -> Self {
        Self {
            identity,
            types: vec![CatalogItemType::PackageDetails],
            content,
        }
    }

    /// Creates a package delete item.
    #[must_use]
    pub fn delete(identity: PackageIdentity, deleted_at: DateTime<Utc>) -> Self {
        let mut content = Map::new();
        content.insert("id".into(), Value::from(identity.id.as_str()));
        content.insert("version".into(), Value::from(identity.version.as_str()));
        content.insert("published".into(), Value::from(deleted_at.to_rfc3339()));
        Self {
            identity,
            types: vec![CatalogItemType::PackageDelete],
            content,
        }
    }

    fn leaf_document(&self, item: &CatalogCommitItem) -> Value {
        let mut doc = self.content.clone();
        let types: Vec<Value> = item.types().iter().map(|t| Value::from(t.as_tag())).collect();
        doc.insert("@id".into(), Value::from(item.location()));
        doc.insert("@type".into(), Value::Array(types));
        doc.insert("catalog:commitId".into(), Value::from(item.commit_id()));
        doc.insert(
            "catalog:commitTimeStamp".into(),
            Value::from(item.commit_timestamp().to_rfc3339()),
        );
        doc.entry("id")
            .or_insert_with(|| Value::from(self.identity.id.as_str()));
        doc.entry("version")
            .or_insert_with(|| Value::from(self.identity.version.as_str()));
        Value::Object(doc)
    }
}

/// Summary of a published commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    /// Commit id shared by every item in the commit.
    pub commit_id: String,
    /// Commit timestamp.
    pub commit_timestamp: DateTime<Utc>,
    /// Number of items committed.
    pub items: usize,
    /// Watermark persisted with the commit.
    pub watermark: Watermark,
    /// Storage version of the new root.
    pub root_version: String,
}

/// Append-only catalog writer. One writer per catalog.
#[derive(Debug)]
pub struct AppendOnlyCatalogWriter {
    storage: ScopedStorage,
    max_page_size: usize,
    staged: Vec<CatalogItem>,
}

impl AppendOnlyCatalogWriter {
    /// Creates a writer over the catalog scope.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self {
            storage,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            staged: Vec::new(),
        }
    }

    /// Sets the maximum number of entries per page (at least 1).
    #[must_use]
    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    /// Stages an item for the next commit.
    pub fn add(&mut self, item: CatalogItem) {
        self.staged.push(item);
    }

    /// Number of staged items.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Drops staged items without committing them.
    pub fn discard(&mut self) {
        self.staged.clear();
    }

    /// Appends all staged items as one commit tagged with `watermark`.
    ///
    /// Returns `Ok(None)` without touching storage if nothing is staged. On
    /// success the staging area is cleared. On failure it is left as is and
    /// nothing the commit wrote is reachable from the root.
    ///
    /// # Errors
    ///
    /// - `CatalogError::WatermarkRegression` if any watermark component would
    ///   move backwards
    /// - `CatalogError::InvalidCommitItem` if an identity is staged twice or an
    ///   item declares no types
    /// - `CatalogError::CasFailed` if another writer published first
    /// - storage errors
    pub async fn commit(&mut self, watermark: Watermark) -> Result<Option<CommitRecord>> {
        if self.staged.is_empty() {
            return Ok(None);
        }

        let started = Instant::now();
        let snapshot = load_root(&self.storage).await?;
        snapshot.root.watermark.check_advance(&watermark)?;

        self.check_unique_identities()?;
        let commit_timestamp = next_commit_timestamp(Utc::now(), snapshot.root.commit_timestamp);

        let commit_id = Uuid::new_v4().to_string();
        let span = commit_span("append", self.staged.len(), commit_timestamp);

        let record = self
            .publish(snapshot.root, snapshot.version, watermark, commit_id, commit_timestamp)
            .instrument(span)
            .await?;

        self.staged.clear();
        metrics::record_commit(record.items, started.elapsed().as_secs_f64());
        tracing::info!(
            commit_id = %record.commit_id,
            commit_timestamp = %record.commit_timestamp.to_rfc3339(),
            items = record.items,
            "catalog commit published"
        );
        Ok(Some(record))
    }

    fn check_unique_identities(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.staged.len());
        for item in &self.staged {
            if !seen.insert(&item.identity) {
                return Err(CatalogError::InvalidCommitItem {
                    message: format!("{} staged twice in one commit", item.identity),
                });
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        root: CatalogRoot,
        root_version: Option<String>,
        watermark: Watermark,
        commit_id: String,
        commit_timestamp: DateTime<Utc>,
    ) -> Result<CommitRecord> {
        let mut leaves = Vec::with_capacity(self.staged.len());
        for staged in &self.staged {
            let item = CatalogCommitItem::new(
                paths::leaf(commit_timestamp, &staged.identity),
                commit_id.clone(),
                commit_timestamp,
                staged.types.iter().copied(),
                staged.identity.clone(),
            )?;
            let document = staged.leaf_document(&item);
            leaves.push((item, document));
        }

        let writes: Vec<_> = leaves
            .iter()
            .map(|(item, document)| async move {
                put_immutable(&self.storage, item.location(), document).await
            })
            .collect();
        stream::iter(writes)
        .buffer_unordered(LEAF_WRITE_CONCURRENCY)
        .try_collect::<Vec<()>>()
        .await?;

        let entries: Vec<PageEntry> = leaves.iter().map(|(item, _)| item.to_page_entry()).collect();
        let items = entries.len();
        let pages = self
            .append_pages(&root.pages, entries, &commit_id, commit_timestamp)
            .await?;

        let next = CatalogRoot {
            version: ROOT_FORMAT_VERSION,
            commit_id: Some(commit_id.clone()),
            commit_timestamp: Some(commit_timestamp),
            count: root.count + items as u64,
            watermark,
            pages,
        };

        let precondition = match root_version {
            Some(version) => WritePrecondition::MatchesVersion(version),
            None => WritePrecondition::DoesNotExist,
        };

        match self
            .storage
            .put_raw(paths::ROOT, json_bytes(&next)?, precondition)
            .await?
        {
            WriteResult::Success { version } => Ok(CommitRecord {
                commit_id,
                commit_timestamp,
                items,
                watermark,
                root_version: version,
            }),
            WriteResult::PreconditionFailed { current_version } => {
                metrics::record_cas_conflict();
                tracing::warn!(
                    commit_id = %commit_id,
                    current_version = %current_version,
                    "catalog root changed during commit"
                );
                Err(CatalogError::CasFailed {
                    message: format!(
                        "catalog root changed during commit {commit_id} (now at version {current_version})"
                    ),
                })
            }
        }
    }

    /// Writes new page versions for `entries`, filling the last page first.
    async fn append_pages(
        &self,
        existing: &[PageRef],
        entries: Vec<PageEntry>,
        commit_id: &str,
        commit_timestamp: DateTime<Utc>,
    ) -> Result<Vec<PageRef>> {
        let mut pages = existing.to_vec();
        let mut remaining = entries.into_iter().peekable();

        let (mut number, mut items) = match pages.last() {
            Some(last) if last.count < self.max_page_size => {
                let page: CatalogPage = read_json(&self.storage, &last.path).await?;
                (pages.len() - 1, page.items)
            }
            _ => (pages.len(), Vec::new()),
        };

        loop {
            while items.len() < self.max_page_size {
                let Some(entry) = remaining.next() else { break };
                items.push(entry);
            }

            let path = paths::page(number, commit_id);
            let page_ref = PageRef {
                path: path.clone(),
                count: items.len(),
                commit_id: commit_id.to_string(),
                commit_timestamp,
            };
            let page = CatalogPage {
                commit_id: commit_id.to_string(),
                commit_timestamp,
                items,
            };
            put_immutable(&self.storage, &path, &page).await?;

            if number < pages.len() {
                pages[number] = page_ref;
            } else {
                pages.push(page_ref);
            }

            if remaining.peek().is_none() {
                break;
            }
            number += 1;
            items = Vec::new();
        }

        Ok(pages)
    }
}

/// Picks a commit timestamp strictly after `previous`.
///
/// If the clock has not moved past the previous commit (clock step, or two
/// commits inside one clock tick) the timestamp is bumped by one microsecond.
fn next_commit_timestamp(now: DateTime<Utc>, previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match previous {
        Some(previous) if now <= previous => {
            let bumped = previous + chrono::Duration::microseconds(1);
            tracing::warn!(
                now = %now.to_rfc3339(),
                previous = %previous.to_rfc3339(),
                "clock did not advance past previous commit; bumping commit timestamp"
            );
            bumped
        }
        _ => now,
    }
}

async fn put_immutable<T: serde::Serialize>(
    storage: &ScopedStorage,
    path: &str,
    value: &T,
) -> Result<()> {
    match storage
        .put_raw(path, json_bytes(value)?, WritePrecondition::DoesNotExist)
        .await?
    {
        WriteResult::Success { .. } => Ok(()),
        WriteResult::PreconditionFailed { .. } => Err(CatalogError::CasFailed {
            message: format!("immutable object already exists: {path}"),
        }),
    }
}
