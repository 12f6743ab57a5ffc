//! Feed delta computation.
//!
//! The [`DeltaFetcher`] asks the source feed for packages created or edited
//! after a watermark, and the deletion audit trail for packages deleted after
//! a watermark. Results are grouped by change timestamp in ascending order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use feedsync_core::PackageIdentity;

use crate::error::{CatalogError, Result};

/// Change timestamps mapped to the changes observed at that instant.
pub type Delta<T> = BTreeMap<DateTime<Utc>, Vec<T>>;

/// Which feed timestamp a query is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Packages first published after the watermark.
    Created,
    /// Packages whose metadata changed after the watermark.
    Edited,
}

impl ChangeKind {
    /// Feed field the query filters and orders on.
    #[must_use]
    pub const fn field(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Edited => "LastEdited",
        }
    }

    /// Lower-case label for logs and metrics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Edited => "edited",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Package metadata as reported by the source feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPackageDetails {
    /// Package identity.
    pub identity: PackageIdentity,
    /// When the package was first pushed.
    pub created: DateTime<Utc>,
    /// When the package metadata last changed.
    #[serde(default)]
    pub last_edited: Option<DateTime<Utc>>,
    /// Publish date; the year 1900 marks an unlisted package.
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    /// License expression or names.
    #[serde(default)]
    pub license_names: Option<String>,
    /// License report location.
    #[serde(default)]
    pub license_report_url: Option<String>,
}

impl FeedPackageDetails {
    /// Returns the timestamp this package is keyed on for `kind`.
    ///
    /// Packages that were never edited have no edit timestamp.
    #[must_use]
    pub fn timestamp(&self, kind: ChangeKind) -> Option<DateTime<Utc>> {
        match kind {
            ChangeKind::Created => Some(self.created),
            ChangeKind::Edited => self.last_edited,
        }
    }

    /// Returns false for packages whose publish year is 1900.
    #[must_use]
    pub fn is_listed(&self) -> bool {
        self.published.is_none_or(|published| published.year() != 1900)
    }
}

/// One deletion recorded by the audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionAuditEntry {
    /// Deleted package.
    pub identity: PackageIdentity,
    /// When the deletion happened.
    pub timestamp: DateTime<Utc>,
}

/// Source feed queried for created and edited packages.
#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Returns up to `top` packages whose `kind` timestamp is strictly after
    /// `since`, ordered ascending by that timestamp.
    async fn get_changed_since(
        &self,
        kind: ChangeKind,
        since: DateTime<Utc>,
        top: usize,
    ) -> Result<Vec<FeedPackageDetails>>;
}

/// Audit trail queried for deleted packages.
#[async_trait]
pub trait DeletionAuditSource: Send + Sync {
    /// Returns deletions recorded strictly after `since`, in any order.
    async fn get_deleted_since(&self, since: DateTime<Utc>) -> Result<Vec<DeletionAuditEntry>>;
}

/// Computes the per-phase deltas for a synchronization cycle.
#[derive(Clone)]
pub struct DeltaFetcher {
    feed: Arc<dyn FeedClient>,
    audit: Arc<dyn DeletionAuditSource>,
    top: usize,
    delete_lookback: Duration,
}

impl fmt::Debug for DeltaFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaFetcher")
            .field("top", &self.top)
            .field("delete_lookback", &self.delete_lookback)
            .finish_non_exhaustive()
    }
}

impl DeltaFetcher {
    /// Creates a fetcher.
    #[must_use]
    pub fn new(
        feed: Arc<dyn FeedClient>,
        audit: Arc<dyn DeletionAuditSource>,
        top: usize,
        delete_lookback: Duration,
    ) -> Self {
        Self {
            feed,
            audit,
            top,
            delete_lookback,
        }
    }

    /// Fetches packages changed strictly after `since`, grouped by their
    /// `kind` timestamp.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::Feed` (or the client's error) if the feed cannot
    /// be read.
    pub async fn fetch_changed(
        &self,
        kind: ChangeKind,
        since: DateTime<Utc>,
    ) -> Result<Delta<FeedPackageDetails>> {
        let packages = self.feed.get_changed_since(kind, since, self.top).await?;

        let mut delta: Delta<FeedPackageDetails> = BTreeMap::new();
        for package in packages {
            match package.timestamp(kind) {
                Some(at) if at > since => delta.entry(at).or_default().push(package),
                _ => {
                    tracing::debug!(
                        kind = %kind,
                        package = %package.identity,
                        since = %since.to_rfc3339(),
                        "ignoring feed entry at or before watermark"
                    );
                }
            }
        }

        tracing::debug!(
            kind = %kind,
            since = %since.to_rfc3339(),
            timestamps = delta.len(),
            "fetched feed delta"
        );
        Ok(delta)
    }

    /// Fetches deletions strictly after `since`.
    ///
    /// The audit trail is queried from `since - delete_lookback`, because
    /// audit records can become visible some time after the deletion they
    /// describe. Records at or before `since` are then dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit trail cannot be read.
    pub async fn fetch_deleted(&self, since: DateTime<Utc>) -> Result<Delta<PackageIdentity>> {
        let lookback = chrono::Duration::from_std(self.delete_lookback).map_err(|e| {
            CatalogError::Invariant {
                message: format!("delete lookback out of range: {e}"),
            }
        })?;
        let query_from = since.checked_sub_signed(lookback).unwrap_or(since);
        let entries = self.audit.get_deleted_since(query_from).await?;

        let mut delta: Delta<PackageIdentity> = BTreeMap::new();
        for entry in entries.into_iter().filter(|e| e.timestamp > since) {
            delta.entry(entry.timestamp).or_default().push(entry.identity);
        }

        tracing::debug!(
            since = %since.to_rfc3339(),
            query_from = %query_from.to_rfc3339(),
            timestamps = delta.len(),
            "fetched deletion delta"
        );
        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, minute, 0)
            .single()
            .expect("valid")
    }

    fn package(id: &str, created: DateTime<Utc>) -> FeedPackageDetails {
        FeedPackageDetails {
            identity: PackageIdentity::new(id, "1.0.0").expect("identity"),
            created,
            last_edited: None,
            published: Some(created),
            license_names: None,
            license_report_url: None,
        }
    }

    struct FixedFeed(Vec<FeedPackageDetails>);

    #[async_trait]
    impl FeedClient for FixedFeed {
        async fn get_changed_since(
            &self,
            _kind: ChangeKind,
            _since: DateTime<Utc>,
            _top: usize,
        ) -> Result<Vec<FeedPackageDetails>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingAudit {
        entries: Vec<DeletionAuditEntry>,
        queried: Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait]
    impl DeletionAuditSource for RecordingAudit {
        async fn get_deleted_since(
            &self,
            since: DateTime<Utc>,
        ) -> Result<Vec<DeletionAuditEntry>> {
            self.queried.lock().expect("lock").push(since);
            Ok(self.entries.clone())
        }
    }

    #[tokio::test]
    async fn groups_changes_by_timestamp_and_drops_watermark_entries() {
        let feed = FixedFeed(vec![
            package("A", at(1)),
            package("B", at(2)),
            package("C", at(2)),
            package("D", at(3)),
        ]);
        let fetcher = DeltaFetcher::new(
            Arc::new(feed),
            Arc::new(RecordingAudit::default()),
            20,
            Duration::from_secs(900),
        );

        let delta = fetcher
            .fetch_changed(ChangeKind::Created, at(1))
            .await
            .expect("fetch");
        let keys: Vec<_> = delta.keys().copied().collect();
        assert_eq!(keys, vec![at(2), at(3)]);
        assert_eq!(delta[&at(2)].len(), 2);
    }

    #[tokio::test]
    async fn edited_query_skips_never_edited_packages() {
        let mut edited = package("A", at(1));
        edited.last_edited = Some(at(5));
        let fetcher = DeltaFetcher::new(
            Arc::new(FixedFeed(vec![edited, package("B", at(2))])),
            Arc::new(RecordingAudit::default()),
            20,
            Duration::from_secs(900),
        );

        let delta = fetcher
            .fetch_changed(ChangeKind::Edited, at(0))
            .await
            .expect("fetch");
        assert_eq!(delta.len(), 1);
        assert!(delta.contains_key(&at(5)));
    }

    #[tokio::test]
    async fn deletes_query_behind_watermark_but_return_only_newer_entries() {
        let identity = PackageIdentity::new("A", "1.0.0").expect("identity");
        let audit = Arc::new(RecordingAudit {
            entries: vec![
                DeletionAuditEntry {
                    identity: identity.clone(),
                    timestamp: at(20),
                },
                DeletionAuditEntry {
                    identity: identity.clone(),
                    timestamp: at(31),
                },
            ],
            queried: Mutex::new(Vec::new()),
        });
        let fetcher = DeltaFetcher::new(
            Arc::new(FixedFeed(Vec::new())),
            audit.clone(),
            20,
            Duration::from_secs(15 * 60),
        );

        let delta = fetcher.fetch_deleted(at(30)).await.expect("fetch");
        assert_eq!(delta.keys().copied().collect::<Vec<_>>(), vec![at(31)]);
        assert_eq!(*audit.queried.lock().expect("lock"), vec![at(15)]);
    }

    #[test]
    fn year_1900_means_unlisted() {
        let mut details = package("A", at(1));
        assert!(details.is_listed());
        details.published = Some(Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).single().expect("valid"));
        assert!(!details.is_listed());
    }
}
