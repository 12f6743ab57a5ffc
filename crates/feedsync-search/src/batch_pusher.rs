//! Batched, reference-counted index publication.
//!
//! The critical invariants are:
//! - Each package id is enqueued at most once per pusher, with at least one
//!   action
//! - A package id's reference count equals its actions still queued across
//!   both logical indexes, and never goes negative
//! - A package id's version list is written exactly once, after the batch
//!   holding its last queued action was accepted by the index
//! - Between pushes, the ids holding a pending version list are exactly the
//!   ids with a nonzero reference count
//!
//! A pusher serves one publication cycle from one task. After a failed push
//! its queues no longer match what the index holds, so every later call fails
//! and the caller starts a new cycle with a new pusher.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use feedsync_core::PackageId;

use crate::error::{Result, SearchError};
use crate::index::{IndexAction, IndexActions, LogicalIndex, SearchIndexClient};
use crate::metrics;
use crate::version_list::{ResultAndAccessCondition, VersionListData, VersionListDataClient};

/// Default maximum actions per index batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

const ERRORS_TO_LOG: usize = 5;
const VERSION_LIST_SAMPLE: usize = 5;

/// Batch pusher configuration.
#[derive(Debug, Clone, Copy)]
pub struct BatchPusherConfig {
    /// Maximum actions per index batch.
    pub batch_size: usize,
}

impl Default for BatchPusherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// What a push submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    /// Batches accepted by the index.
    pub batches: usize,
    /// Actions in those batches.
    pub actions: usize,
    /// Version lists written.
    pub version_lists: usize,
}

impl std::ops::AddAssign for PushSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.batches += rhs.batches;
        self.actions += rhs.actions;
        self.version_lists += rhs.version_lists;
    }
}

#[derive(Debug)]
struct Queued {
    package_id: PackageId,
    action: IndexAction,
}

type PendingVersionList = (PackageId, ResultAndAccessCondition<VersionListData>);

/// Accumulates index actions per package id and pushes them in batches.
pub struct BatchPusher {
    search: Arc<dyn SearchIndexClient>,
    hijack: Arc<dyn SearchIndexClient>,
    version_lists: Arc<dyn VersionListDataClient>,
    batch_size: usize,
    enqueued: HashSet<String>,
    reference_counts: HashMap<String, usize>,
    search_actions: VecDeque<Queued>,
    hijack_actions: VecDeque<Queued>,
    version_list_results: HashMap<String, PendingVersionList>,
    failed: bool,
}

impl std::fmt::Debug for BatchPusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPusher")
            .field("batch_size", &self.batch_size)
            .field("search_queued", &self.search_actions.len())
            .field("hijack_queued", &self.hijack_actions.len())
            .field("pending_version_lists", &self.version_list_results.len())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl BatchPusher {
    /// Creates a pusher for one publication cycle.
    #[must_use]
    pub fn new(
        search: Arc<dyn SearchIndexClient>,
        hijack: Arc<dyn SearchIndexClient>,
        version_lists: Arc<dyn VersionListDataClient>,
        config: BatchPusherConfig,
    ) -> Self {
        Self {
            search,
            hijack,
            version_lists,
            batch_size: config.batch_size.max(1),
            enqueued: HashSet::new(),
            reference_counts: HashMap::new(),
            search_actions: VecDeque::new(),
            hijack_actions: VecDeque::new(),
            version_list_results: HashMap::new(),
            failed: false,
        }
    }

    /// Queues the actions of one package id.
    ///
    /// # Errors
    ///
    /// - `SearchError::AlreadyEnqueued` if the id (compared case-insensitively)
    ///   was enqueued before on this pusher
    /// - `SearchError::NoIndexActions` if `actions` holds no action
    /// - `SearchError::Invariant` after a failed push
    pub fn enqueue(&mut self, package_id: &PackageId, actions: IndexActions) -> Result<()> {
        self.ensure_usable()?;
        let key = package_id.key().to_string();

        if self.enqueued.contains(&key) {
            return Err(SearchError::AlreadyEnqueued {
                package_id: package_id.as_str().to_string(),
            });
        }
        if actions.is_empty() {
            return Err(SearchError::NoIndexActions {
                package_id: package_id.as_str().to_string(),
            });
        }

        let IndexActions {
            search,
            hijack,
            version_list,
        } = actions;
        for action in hijack {
            self.enqueue_and_increment(LogicalIndex::Hijack, package_id, action)?;
        }
        for action in search {
            self.enqueue_and_increment(LogicalIndex::Search, package_id, action)?;
        }

        self.enqueued.insert(key.clone());
        self.version_list_results
            .insert(key, (package_id.clone(), version_list));
        Ok(())
    }

    /// Pushes every queue that holds at least a full batch.
    ///
    /// # Errors
    ///
    /// See [`BatchPusher::finish`].
    pub async fn push_full_batches(&mut self) -> Result<PushSummary> {
        self.push_batches(true).await
    }

    /// Pushes everything still queued.
    ///
    /// # Errors
    ///
    /// - `SearchError::IndexingFailed` if the index rejected documents of a
    ///   batch; no package id finishing in that batch gets its version list
    /// - `SearchError::VersionListConflict` if a version list changed since
    ///   it was read
    /// - `SearchError::Invariant` if reference counts and pending version
    ///   lists disagree
    /// - backend errors
    pub async fn finish(&mut self) -> Result<PushSummary> {
        self.push_batches(false).await
    }

    /// Current reference count of `package_id`.
    #[must_use]
    pub fn reference_count(&self, package_id: &PackageId) -> usize {
        self.reference_counts
            .get(package_id.key())
            .copied()
            .unwrap_or(0)
    }

    /// Actions queued for `index`.
    #[must_use]
    pub fn queued(&self, index: LogicalIndex) -> usize {
        match index {
            LogicalIndex::Search => self.search_actions.len(),
            LogicalIndex::Hijack => self.hijack_actions.len(),
        }
    }

    /// Version lists waiting for their package id's last action.
    #[must_use]
    pub fn pending_version_lists(&self) -> usize {
        self.version_list_results.len()
    }

    /// Returns true if the ids with a pending version list are exactly the
    /// ids with a nonzero reference count.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.reference_counts.len() == self.version_list_results.len()
            && self
                .reference_counts
                .keys()
                .all(|k| self.version_list_results.contains_key(k))
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.failed {
            return Err(SearchError::invariant(
                "batch pusher used after a failed push",
            ));
        }
        Ok(())
    }

    fn queue_mut(&mut self, index: LogicalIndex) -> &mut VecDeque<Queued> {
        match index {
            LogicalIndex::Search => &mut self.search_actions,
            LogicalIndex::Hijack => &mut self.hijack_actions,
        }
    }

    fn client(&self, index: LogicalIndex) -> Arc<dyn SearchIndexClient> {
        match index {
            LogicalIndex::Search => self.search.clone(),
            LogicalIndex::Hijack => self.hijack.clone(),
        }
    }

    fn enqueue_and_increment(
        &mut self,
        index: LogicalIndex,
        package_id: &PackageId,
        action: IndexAction,
    ) -> Result<()> {
        let count = self
            .reference_counts
            .entry(package_id.key().to_string())
            .or_insert(0);
        *count += 1;

        self.queue_mut(index).push_back(Queued {
            package_id: package_id.clone(),
            action,
        });
        Ok(())
    }

    /// Decrements the reference count of `package_id` and returns the new
    /// count. The entry is removed when it reaches zero.
    fn dequeue_and_decrement(&mut self, package_id: &PackageId) -> Result<usize> {
        let key = package_id.key();
        let Some(count) = self.reference_counts.get_mut(key) else {
            return Err(SearchError::invariant(format!(
                "dequeued an action for {package_id} without a reference count"
            )));
        };

        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.reference_counts.remove(key);
        }
        Ok(remaining)
    }

    async fn push_batches(&mut self, only_full: bool) -> Result<PushSummary> {
        self.ensure_usable()?;

        let mut summary = PushSummary::default();
        for index in [LogicalIndex::Hijack, LogicalIndex::Search] {
            match self.push_index(index, only_full).await {
                Ok(pushed) => summary += pushed,
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }

        if !self.is_consistent() {
            self.failed = true;
            let mut without_count: Vec<_> = self
                .version_list_results
                .keys()
                .filter(|k| !self.reference_counts.contains_key(*k))
                .cloned()
                .collect();
            let mut without_result: Vec<_> = self
                .reference_counts
                .keys()
                .filter(|k| !self.version_list_results.contains_key(*k))
                .cloned()
                .collect();
            without_count.sort();
            without_result.sort();
            return Err(SearchError::invariant(format!(
                "version lists without reference counts: {without_count:?}; \
                 reference counts without version lists: {without_result:?}"
            )));
        }

        Ok(summary)
    }

    async fn push_index(&mut self, index: LogicalIndex, only_full: bool) -> Result<PushSummary> {
        let mut summary = PushSummary::default();

        loop {
            let queued = self.queued(index);
            let ready = if only_full {
                queued >= self.batch_size
            } else {
                queued > 0
            };
            if !ready {
                break;
            }

            let mut batch = Vec::with_capacity(self.batch_size.min(queued));
            let mut finished: Vec<PendingVersionList> = Vec::new();
            while batch.len() < self.batch_size {
                let Some(Queued { package_id, action }) = self.queue_mut(index).pop_front() else {
                    break;
                };
                batch.push(action);

                if self.dequeue_and_decrement(&package_id)? == 0 {
                    let pending = self
                        .version_list_results
                        .remove(package_id.key())
                        .ok_or_else(|| {
                            SearchError::invariant(format!(
                                "no pending version list for finished package id {package_id}"
                            ))
                        })?;
                    finished.push(pending);
                }
            }

            summary.actions += batch.len();
            self.index_batch(index, batch).await?;
            summary.batches += 1;

            if !finished.is_empty() {
                summary.version_lists += self.replace_version_lists(finished).await?;
            }
        }

        Ok(summary)
    }

    /// Submits one batch to `index`.
    pub(crate) async fn index_batch(&self, index: LogicalIndex, batch: Vec<IndexAction>) -> Result<()> {
        submit_batch(self.client(index).as_ref(), batch, self.batch_size).await
    }

    async fn replace_version_lists(&self, mut finished: Vec<PendingVersionList>) -> Result<usize> {
        finished.sort_by_key(|(_, pending)| std::cmp::Reverse(pending.result.listed_count()));
        let sample: Vec<&str> = finished
            .iter()
            .take(VERSION_LIST_SAMPLE)
            .map(|(id, _)| id.as_str())
            .collect();
        tracing::info!(
            count = finished.len(),
            sample = ?sample,
            "updating version lists"
        );

        let started = Instant::now();
        for (package_id, pending) in &finished {
            tracing::debug!(package_id = %package_id, "updating version list");
            self.version_lists
                .replace(package_id, &pending.result, &pending.access_condition)
                .await?;
        }
        tracing::info!(
            count = finished.len(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "updated version lists"
        );
        Ok(finished.len())
    }
}

/// Submits one batch and fails if any document was rejected.
///
/// A batch larger than `limit` is rejected without reaching the index. Up to
/// a few rejected documents are logged individually.
pub(crate) async fn submit_batch(
    client: &dyn SearchIndexClient,
    batch: Vec<IndexAction>,
    limit: usize,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    if batch.len() > limit {
        return Err(SearchError::BatchTooLarge {
            size: batch.len(),
            limit,
        });
    }

    let size = batch.len();
    tracing::info!(
        batch_size = size,
        index = client.index_name(),
        "pushing index batch"
    );

    let started = Instant::now();
    let results = client.index(batch).await?;

    let mut error_count = 0;
    for result in results.iter().filter(|r| !r.succeeded) {
        if error_count < ERRORS_TO_LOG {
            tracing::error!(
                key = %result.key,
                status_code = result.status_code,
                error = result.error_message.as_deref().unwrap_or(""),
                "indexing document failed"
            );
        }
        error_count += 1;
    }
    metrics::record_batch(
        client.index_name(),
        size,
        error_count,
        started.elapsed().as_secs_f64(),
    );

    if error_count > 0 {
        tracing::error!(
            error_count,
            logged = error_count.min(ERRORS_TO_LOG),
            index = client.index_name(),
            "errors indexing a batch"
        );
        return Err(SearchError::IndexingFailed {
            index: client.index_name().to_string(),
            error_count,
        });
    }
    Ok(())
}
