//! Pre-built test fixtures for common test scenarios.
//!
//! Provides factory functions to create test data with sensible defaults.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use feedsync_catalog::delta::{DeletionAuditEntry, FeedPackageDetails};
use feedsync_core::{PackageIdentity, ScopedStorage};

use crate::storage::TracingMemoryBackend;

/// Test context with one shared backend and the scopes the pipeline uses.
#[derive(Debug, Clone)]
pub struct TestContext {
    /// Shared storage backend.
    pub storage: Arc<TracingMemoryBackend>,
    /// Catalog scope.
    pub catalog: ScopedStorage,
    /// Cursor and version list scope.
    pub state: ScopedStorage,
}

impl TestContext {
    /// Creates a new test context over empty storage.
    #[must_use]
    pub fn new() -> Self {
        let storage = Arc::new(TracingMemoryBackend::new());
        let catalog = ScopedStorage::new(storage.clone(), "catalog").expect("catalog scope");
        let state = ScopedStorage::new(storage.clone(), "state").expect("state scope");
        Self {
            storage,
            catalog,
            state,
        }
    }

    /// Returns a further scope over the same backend.
    #[must_use]
    pub fn scope(&self, name: &str) -> ScopedStorage {
        ScopedStorage::new(self.storage.clone(), name).expect("valid scope")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a fixed instant `minutes` after 2024-07-01T09:00:00Z.
#[must_use]
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0)
        .single()
        .expect("valid base instant")
        + Duration::minutes(minutes)
}

/// Builds a package identity.
#[must_use]
pub fn identity(id: &str, version: &str) -> PackageIdentity {
    PackageIdentity::new(id, version).expect("valid identity")
}

/// Builds a listed, never-edited feed package created at `created`.
#[must_use]
pub fn package(id: &str, version: &str, created: DateTime<Utc>) -> FeedPackageDetails {
    FeedPackageDetails {
        identity: identity(id, version),
        created,
        last_edited: None,
        published: Some(created),
        license_names: None,
        license_report_url: None,
    }
}

/// Builds a feed package created at `created` and last edited at `edited`.
#[must_use]
pub fn edited_package(
    id: &str,
    version: &str,
    created: DateTime<Utc>,
    edited: DateTime<Utc>,
) -> FeedPackageDetails {
    FeedPackageDetails {
        last_edited: Some(edited),
        ..package(id, version, created)
    }
}

/// Builds a deletion audit entry.
#[must_use]
pub fn deletion(id: &str, version: &str, timestamp: DateTime<Utc>) -> DeletionAuditEntry {
    DeletionAuditEntry {
        identity: identity(id, version),
        timestamp,
    }
}
