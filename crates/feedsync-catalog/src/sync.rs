//! Feed-to-catalog synchronization cycle.
//!
//! Each iteration runs three phases against a watermark resolved from the
//! catalog root:
//!
//! 1. **Deletes**: deletions after `lastDeleted`, segmented so that no commit
//!    repeats an identity, one commit per segment
//! 2. **Creates** (skippable): packages created after `lastCreated`, one commit
//! 3. **Edits**: packages edited after `lastEdited`, one commit; when creates
//!    are skipped this also carries `lastCreated` forward
//!
//! The watermark only advances through a successful commit. If a phase fails,
//! the error propagates and the next iteration starts again from whatever the
//! root says.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use feedsync_core::ScopedStorage;
use feedsync_core::observability::sync_span;

use crate::delta::{ChangeKind, DeletionAuditSource, DeltaFetcher, FeedClient};
use crate::error::Result;
use crate::item_creator::{CatalogItemCreator, FeedMetadataItemCreator, create_items};
use crate::metrics;
use crate::reader::CatalogReader;
use crate::segment::segment_deletes;
use crate::watermark::ResolvedWatermark;
use crate::writer::{AppendOnlyCatalogWriter, CatalogItem, DEFAULT_MAX_PAGE_SIZE};

/// Configuration for the feed-to-catalog cycle.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum packages requested from the feed per phase.
    pub top: usize,
    /// Skip the creates phase; edits then also advance `lastCreated`.
    pub skip_created: bool,
    /// Starting point when the catalog has no `lastCreated`.
    pub start_date: Option<DateTime<Utc>>,
    /// How far behind `lastDeleted` the audit trail is queried.
    pub delete_lookback: Duration,
    /// Pause between consecutive delete-segment commits.
    pub commit_spacing: Duration,
    /// Maximum entries per catalog page.
    pub max_page_size: usize,
    /// Maximum catalog items created concurrently.
    pub max_degree_of_parallelism: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            top: 20,
            skip_created: false,
            start_date: None,
            delete_lookback: Duration::from_secs(15 * 60),
            commit_spacing: Duration::from_secs(1),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            max_degree_of_parallelism: 4,
        }
    }
}

/// Packages processed by one iteration (or accumulated over several).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationCounts {
    /// Created packages committed.
    pub created: usize,
    /// Edited packages committed.
    pub edited: usize,
    /// Deletions committed.
    pub deleted: usize,
}

impl IterationCounts {
    /// Total packages processed.
    #[must_use]
    pub fn total(&self) -> usize {
        self.created + self.edited + self.deleted
    }
}

impl std::ops::AddAssign for IterationCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.edited += rhs.edited;
        self.deleted += rhs.deleted;
    }
}

/// The feed-to-catalog job.
pub struct Feed2Catalog {
    reader: CatalogReader,
    writer: AppendOnlyCatalogWriter,
    fetcher: DeltaFetcher,
    creator: Arc<dyn CatalogItemCreator>,
    config: SyncConfig,
    iteration: u64,
    committed: IterationCounts,
}

impl std::fmt::Debug for Feed2Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed2Catalog")
            .field("config", &self.config)
            .field("iteration", &self.iteration)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

impl Feed2Catalog {
    /// Creates the job over a catalog scope.
    #[must_use]
    pub fn new(
        catalog: ScopedStorage,
        feed: Arc<dyn FeedClient>,
        audit: Arc<dyn DeletionAuditSource>,
        config: SyncConfig,
    ) -> Self {
        let fetcher = DeltaFetcher::new(feed, audit, config.top, config.delete_lookback);
        Self {
            reader: CatalogReader::new(catalog.clone()),
            writer: AppendOnlyCatalogWriter::new(catalog).with_max_page_size(config.max_page_size),
            fetcher,
            creator: Arc::new(FeedMetadataItemCreator),
            config,
            iteration: 0,
            committed: IterationCounts::default(),
        }
    }

    /// Replaces the catalog item creator.
    #[must_use]
    pub fn with_item_creator(mut self, creator: Arc<dyn CatalogItemCreator>) -> Self {
        self.creator = creator;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Packages committed over the lifetime of this job, including commits
    /// made by iterations that later failed.
    #[must_use]
    pub fn committed(&self) -> IterationCounts {
        self.committed
    }

    /// Runs iterations until one processes nothing or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the first iteration error. Packages committed before it are
    /// logged and stay counted in [`Feed2Catalog::committed`].
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<IterationCounts> {
        let before = self.committed;
        loop {
            let counts = match self.run_iteration(cancel).await {
                Ok(counts) => counts,
                Err(e) => {
                    let total = self.committed_since(before);
                    tracing::warn!(
                        created = total.created,
                        edited = total.edited,
                        deleted = total.deleted,
                        error = %e,
                        "run failed after committing"
                    );
                    return Err(e);
                }
            };
            if counts.total() == 0 || cancel.is_cancelled() {
                return Ok(self.committed_since(before));
            }
        }
    }

    fn committed_since(&self, before: IterationCounts) -> IterationCounts {
        IterationCounts {
            created: self.committed.created - before.created,
            edited: self.committed.edited - before.edited,
            deleted: self.committed.deleted - before.deleted,
        }
    }

    /// Runs one deletes / creates / edits iteration.
    ///
    /// Cancellation is checked at phase boundaries and before each commit; a
    /// cancelled iteration returns the counts committed so far.
    ///
    /// # Errors
    ///
    /// Returns fetch, creation, or commit errors. Commits that completed
    /// before the error stay published.
    pub async fn run_iteration(&mut self, cancel: &CancellationToken) -> Result<IterationCounts> {
        self.iteration += 1;
        let span = sync_span("feed2catalog", self.iteration);
        self.iteration_inner(cancel).instrument(span).await
    }

    async fn iteration_inner(&mut self, cancel: &CancellationToken) -> Result<IterationCounts> {
        let mut counts = IterationCounts::default();
        let outcome = self.phases(&mut counts, cancel).await;
        self.committed += counts;

        match outcome {
            Ok(()) => {
                tracing::info!(
                    created = counts.created,
                    edited = counts.edited,
                    deleted = counts.deleted,
                    "iteration complete"
                );
                Ok(counts)
            }
            Err(e) => {
                tracing::warn!(
                    created = counts.created,
                    edited = counts.edited,
                    deleted = counts.deleted,
                    error = %e,
                    "iteration failed; committed packages stay published"
                );
                Err(e)
            }
        }
    }

    async fn phases(
        &mut self,
        counts: &mut IterationCounts,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let stored = self.reader.watermark().await?;
        let mut watermark = stored.resolve(self.config.start_date, self.config.skip_created);
        tracing::info!(
            last_created = %watermark.created.to_rfc3339(),
            last_edited = %watermark.edited.to_rfc3339(),
            last_deleted = %watermark.deleted.to_rfc3339(),
            "starting iteration"
        );

        if cancel.is_cancelled() {
            return Ok(());
        }
        self.deletes_phase(&mut watermark, &mut counts.deleted, cancel)
            .await?;

        if !self.config.skip_created && !cancel.is_cancelled() {
            counts.created = self
                .changes_phase(ChangeKind::Created, &mut watermark, cancel)
                .await?;
        }

        if !cancel.is_cancelled() {
            counts.edited = self
                .changes_phase(ChangeKind::Edited, &mut watermark, cancel)
                .await?;
        }
        Ok(())
    }

    async fn deletes_phase(
        &mut self,
        watermark: &mut ResolvedWatermark,
        committed: &mut usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !watermark.deletes_enabled() {
            tracing::debug!("deletes phase skipped: lastDeleted is unset");
            return Ok(());
        }

        let deletes = self
            .fetcher
            .fetch_deleted(watermark.deleted)
            .await?;
        let segments = segment_deletes(&deletes);
        tracing::info!(
            since = %watermark.deleted.to_rfc3339(),
            deletions = deletes.values().map(Vec::len).sum::<usize>(),
            segments = segments.len(),
            "fetched deletions"
        );

        for (index, segment) in segments.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if index > 0 && !self.config.commit_spacing.is_zero() {
                tokio::time::sleep(self.config.commit_spacing).await;
            }

            let mut next = *watermark;
            for (deleted_at, identities) in segment.iter() {
                for identity in identities {
                    self.writer
                        .add(CatalogItem::delete(identity.clone(), *deleted_at));
                }
                next.deleted = *deleted_at;
            }

            self.commit_staged(next).await?;
            *watermark = next;
            *committed += segment.len();
            metrics::record_packages("deleted", segment.len());
        }
        Ok(())
    }

    async fn changes_phase(
        &mut self,
        kind: ChangeKind,
        watermark: &mut ResolvedWatermark,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let since = match kind {
            ChangeKind::Created => watermark.created,
            ChangeKind::Edited => watermark.edited,
        };
        let delta = self
            .fetcher
            .fetch_changed(kind, since)
            .await?;
        let Some(latest) = delta.keys().next_back().copied() else {
            return Ok(0);
        };

        let packages: Vec<_> = delta.into_values().flatten().collect();
        let items = create_items(
            &self.creator,
            &packages,
            self.config.max_degree_of_parallelism,
        )
        .await?;

        let mut next = *watermark;
        match kind {
            ChangeKind::Created => next.created = latest,
            ChangeKind::Edited => {
                next.edited = latest;
                if self.config.skip_created {
                    next.created = next.created.max(latest);
                }
            }
        }

        if cancel.is_cancelled() {
            return Ok(0);
        }

        let count = items.len();
        for item in items {
            self.writer.add(item);
        }
        self.commit_staged(next).await?;
        *watermark = next;

        tracing::info!(
            kind = %kind,
            packages = count,
            watermark = %latest.to_rfc3339(),
            "committed feed changes"
        );
        metrics::record_packages(kind.label(), count);
        Ok(count)
    }

    /// Commits staged items; a failed commit drops them so the next iteration
    /// refetches from the durable watermark.
    async fn commit_staged(&mut self, next: ResolvedWatermark) -> Result<()> {
        if let Err(e) = self.writer.commit(next.to_watermark()).await {
            tracing::warn!(
                staged = self.writer.staged_len(),
                error = %e,
                "catalog commit failed; discarding staged items"
            );
            self.writer.discard();
            return Err(e);
        }
        Ok(())
    }
}
