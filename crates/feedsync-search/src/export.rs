//! Bulk export for historical backfill.
//!
//! The key space of a source is split into contiguous, non-overlapping
//! ranges, and the ranges are indexed concurrently. Ranges never
//! share a document, so no ordering between them is needed.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;

use crate::batch_pusher::{DEFAULT_BATCH_SIZE, submit_batch};
use crate::error::{Result, SearchError};
use crate::index::{IndexAction, SearchIndexClient};

/// Default maximum keys per range.
pub const DEFAULT_KEYS_PER_RANGE: usize = 50_000;

/// Key range `[begin, end)`, or `[begin, u64::MAX]` when `end` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    /// First key in the range.
    pub begin: u64,
    /// First key after the range; `None` for the last range.
    pub end: Option<u64>,
}

impl KeyRange {
    /// Returns true if `key` falls in the range.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.begin <= key && self.end.is_none_or(|end| key < end)
    }
}

/// Splits `keys` into ranges of at most `max_per_range` keys.
///
/// Each range ends where the next begins; the last range is open-ended.
/// Duplicate keys are counted once.
#[must_use]
pub fn key_ranges(keys: &[u64], max_per_range: usize) -> Vec<KeyRange> {
    let mut keys = keys.to_vec();
    keys.sort_unstable();
    keys.dedup();

    let chunks: Vec<&[u64]> = keys.chunks(max_per_range.max(1)).collect();
    chunks
        .iter()
        .enumerate()
        .filter_map(|(i, chunk)| {
            let begin = *chunk.first()?;
            let end = chunks.get(i + 1).and_then(|next| next.first().copied());
            Some(KeyRange { begin, end })
        })
        .collect()
}

/// Source of documents to export.
#[async_trait]
pub trait ExportSource: Send + Sync {
    /// All keys to export.
    async fn keys(&self) -> Result<Vec<u64>>;

    /// Index actions for the documents whose keys fall in `range`.
    async fn documents(&self, range: KeyRange) -> Result<Vec<IndexAction>>;
}

/// Export configuration.
#[derive(Debug, Clone, Copy)]
pub struct ExportConfig {
    /// Maximum keys per range.
    pub keys_per_range: usize,
    /// Maximum actions per index batch.
    pub batch_size: usize,
    /// Ranges exported concurrently.
    pub parallelism: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            keys_per_range: DEFAULT_KEYS_PER_RANGE,
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: 4,
        }
    }
}

/// What an export indexed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// Ranges indexed.
    pub ranges: usize,
    /// Ranges skipped because the export was cancelled.
    pub skipped: usize,
    /// Batches submitted.
    pub batches: usize,
    /// Actions submitted.
    pub actions: usize,
}

impl std::ops::AddAssign for ExportSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.ranges += rhs.ranges;
        self.skipped += rhs.skipped;
        self.batches += rhs.batches;
        self.actions += rhs.actions;
    }
}

/// Exports every document of `source` into `index`.
///
/// # Errors
///
/// Returns the first source or indexing error. Ranges already indexed stay
/// indexed.
pub async fn export(
    source: Arc<dyn ExportSource>,
    index: Arc<dyn SearchIndexClient>,
    config: ExportConfig,
    cancel: &CancellationToken,
) -> Result<ExportSummary> {
    let keys = source.keys().await?;
    let ranges = key_ranges(&keys, config.keys_per_range);
    tracing::info!(
        keys = keys.len(),
        ranges = ranges.len(),
        index = index.index_name(),
        "starting export"
    );

    let summary = stream::iter(ranges.into_iter().map(|range| {
        export_range(
            source.as_ref(),
            index.as_ref(),
            range,
            config.batch_size.max(1),
            cancel,
        )
    }))
    .buffer_unordered(config.parallelism.max(1))
    .try_fold(ExportSummary::default(), |mut total, range| async move {
        total += range;
        Ok::<_, SearchError>(total)
    })
    .await?;

    tracing::info!(
        ranges = summary.ranges,
        skipped = summary.skipped,
        actions = summary.actions,
        "export complete"
    );
    Ok(summary)
}

async fn export_range(
    source: &dyn ExportSource,
    index: &dyn SearchIndexClient,
    range: KeyRange,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<ExportSummary> {
    let mut summary = ExportSummary::default();
    if cancel.is_cancelled() {
        summary.skipped = 1;
        return Ok(summary);
    }

    let documents = source.documents(range).await?;
    tracing::debug!(
        begin = range.begin,
        end = ?range.end,
        documents = documents.len(),
        "exporting range"
    );
    for chunk in documents.chunks(batch_size) {
        submit_batch(index, chunk.to_vec(), batch_size).await?;
        summary.batches += 1;
        summary.actions += chunk.len();
    }
    summary.ranges = 1;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_contiguous_and_the_last_is_open_ended() {
        let keys = [7, 1, 3, 9, 12, 3];
        let ranges = key_ranges(&keys, 2);

        assert_eq!(
            ranges,
            vec![
                KeyRange {
                    begin: 1,
                    end: Some(7),
                },
                KeyRange {
                    begin: 7,
                    end: Some(12),
                },
                KeyRange {
                    begin: 12,
                    end: None,
                },
            ]
        );
        for key in keys {
            assert_eq!(ranges.iter().filter(|r| r.contains(key)).count(), 1);
        }
    }

    #[test]
    fn largest_possible_key_stays_in_the_last_range() {
        let keys = [u64::MAX - 1, 5, u64::MAX];
        let ranges = key_ranges(&keys, 2);

        assert_eq!(ranges.len(), 2);
        let last = ranges.last().expect("last range");
        assert_eq!(last.begin, u64::MAX);
        assert!(last.contains(u64::MAX));
        for key in keys {
            assert_eq!(ranges.iter().filter(|r| r.contains(key)).count(), 1);
        }
    }

    #[test]
    fn no_keys_no_ranges() {
        assert!(key_ranges(&[], 10).is_empty());
    }
}
