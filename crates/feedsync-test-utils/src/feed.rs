//! In-memory feed and audit sources.
//!
//! [`ScriptedFeed`] answers change queries the way the gallery does: entries
//! strictly after the requested instant, ascending by the change timestamp,
//! capped at `top`. Packages can be added between iterations to simulate new
//! traffic.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_catalog::delta::{
    ChangeKind, DeletionAuditEntry, DeletionAuditSource, FeedClient, FeedPackageDetails,
};
use feedsync_catalog::error::{CatalogError, Result};

/// Scripted [`FeedClient`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedFeed {
    packages: Arc<Mutex<Vec<FeedPackageDetails>>>,
    failures: Arc<Mutex<usize>>,
    queries: Arc<Mutex<Vec<(ChangeKind, DateTime<Utc>)>>>,
}

impl ScriptedFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a feed holding `packages`.
    #[must_use]
    pub fn with_packages(packages: impl IntoIterator<Item = FeedPackageDetails>) -> Self {
        let feed = Self::new();
        feed.extend(packages);
        feed
    }

    /// Adds packages to the feed.
    pub fn extend(&self, packages: impl IntoIterator<Item = FeedPackageDetails>) {
        self.packages.lock().expect("lock").extend(packages);
    }

    /// Makes the next `count` queries fail with a feed error.
    pub fn fail_next(&self, count: usize) {
        *self.failures.lock().expect("lock") = count;
    }

    /// Returns the queries received, as `(kind, since)`.
    #[must_use]
    pub fn queries(&self) -> Vec<(ChangeKind, DateTime<Utc>)> {
        self.queries.lock().expect("lock").clone()
    }
}

#[async_trait]
impl FeedClient for ScriptedFeed {
    async fn get_changed_since(
        &self,
        kind: ChangeKind,
        since: DateTime<Utc>,
        top: usize,
    ) -> Result<Vec<FeedPackageDetails>> {
        self.queries.lock().expect("lock").push((kind, since));
        {
            let mut failures = self.failures.lock().expect("lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(CatalogError::feed("scripted feed failure"));
            }
        }

        let mut matching: Vec<_> = self
            .packages
            .lock()
            .expect("lock")
            .iter()
            .filter(|p| p.timestamp(kind).is_some_and(|at| at > since))
            .cloned()
            .collect();
        matching.sort_by_key(|p| p.timestamp(kind));
        matching.truncate(top);
        Ok(matching)
    }
}

/// [`DeletionAuditSource`] over a fixed list of entries.
#[derive(Debug, Clone, Default)]
pub struct StaticAuditSource {
    entries: Arc<Mutex<Vec<DeletionAuditEntry>>>,
}

impl StaticAuditSource {
    /// Creates a source holding `entries`.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = DeletionAuditEntry>) -> Self {
        let source = Self::default();
        source.extend(entries);
        source
    }

    /// Adds entries to the source.
    pub fn extend(&self, entries: impl IntoIterator<Item = DeletionAuditEntry>) {
        self.entries.lock().expect("lock").extend(entries);
    }
}

#[async_trait]
impl DeletionAuditSource for StaticAuditSource {
    async fn get_deleted_since(&self, since: DateTime<Utc>) -> Result<Vec<DeletionAuditEntry>> {
        Ok(self
            .entries
            .lock()
            .expect("lock")
            .iter()
            .filter(|e| e.timestamp > since)
            .cloned()
            .collect())
    }
}
