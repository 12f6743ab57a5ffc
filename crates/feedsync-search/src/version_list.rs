//! Per-package version lists.
//!
//! A version list records every known version of one package id and whether
//! it is listed. It is read once per publication cycle together with an
//! access condition, and written back at most once, conditionally on that
//! access condition.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use feedsync_core::{PackageId, ScopedStorage, WritePrecondition, WriteResult};

use crate::error::{Result, SearchError};
use crate::metrics;

/// Listing state of one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionProperties {
    /// Whether the version is listed.
    pub listed: bool,
}

/// All known versions of one package id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionListData {
    /// Version properties keyed by normalized version.
    #[serde(default)]
    pub version_properties: BTreeMap<String, VersionProperties>,
}

impl VersionListData {
    /// Records `version` with its listing state.
    pub fn upsert(&mut self, version: impl Into<String>, listed: bool) {
        self.version_properties
            .insert(version.into(), VersionProperties { listed });
    }

    /// Forgets `version`. Returns true if it was known.
    pub fn remove(&mut self, version: &str) -> bool {
        self.version_properties.remove(version).is_some()
    }

    /// Listed versions, in key order.
    pub fn listed(&self) -> impl Iterator<Item = &str> {
        self.version_properties
            .iter()
            .filter(|(_, p)| p.listed)
            .map(|(v, _)| v.as_str())
    }

    /// Number of listed versions.
    #[must_use]
    pub fn listed_count(&self) -> usize {
        self.listed().count()
    }
}

/// Optimistic concurrency token for a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessCondition {
    /// The document must not exist yet.
    IfNotExists,
    /// The document must still be at this version.
    IfMatch(String),
}

impl AccessCondition {
    fn precondition(&self) -> WritePrecondition {
        match self {
            Self::IfNotExists => WritePrecondition::DoesNotExist,
            Self::IfMatch(version) => WritePrecondition::MatchesVersion(version.clone()),
        }
    }
}

/// A read result together with the condition for writing it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultAndAccessCondition<T> {
    /// The value read (possibly modified since).
    pub result: T,
    /// Condition under which the value may be replaced.
    pub access_condition: AccessCondition,
}

/// Reads and conditionally replaces version lists.
#[async_trait]
pub trait VersionListDataClient: Send + Sync {
    /// Reads the version list of `package_id`. A missing list is empty and
    /// carries [`AccessCondition::IfNotExists`].
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read.
    async fn read(&self, package_id: &PackageId) -> Result<ResultAndAccessCondition<VersionListData>>;

    /// Replaces the version list of `package_id` if `access_condition` still
    /// holds.
    ///
    /// # Errors
    ///
    /// Returns `SearchError::VersionListConflict` if the list changed since it
    /// was read, or a backend error.
    async fn replace(
        &self,
        package_id: &PackageId,
        data: &VersionListData,
        access_condition: &AccessCondition,
    ) -> Result<()>;
}

/// [`VersionListDataClient`] over a storage scope, one JSON document per
/// lower-cased package id under `version-lists/`.
#[derive(Debug, Clone)]
pub struct StorageVersionListClient {
    storage: ScopedStorage,
}

impl StorageVersionListClient {
    /// Creates a client over `storage`.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self { storage }
    }

    fn path(package_id: &PackageId) -> String {
        format!("version-lists/{}.json", package_id.key())
    }
}

#[async_trait]
impl VersionListDataClient for StorageVersionListClient {
    async fn read(&self, package_id: &PackageId) -> Result<ResultAndAccessCondition<VersionListData>> {
        let path = Self::path(package_id);
        let Some(meta) = self.storage.head_raw(&path).await? else {
            return Ok(ResultAndAccessCondition {
                result: VersionListData::default(),
                access_condition: AccessCondition::IfNotExists,
            });
        };

        let bytes = self.storage.get_raw(&path).await?;
        let result = serde_json::from_slice(&bytes).map_err(|e| SearchError::Serialization {
            message: format!("parse version list {path}: {e}"),
        })?;
        Ok(ResultAndAccessCondition {
            result,
            access_condition: AccessCondition::IfMatch(meta.version),
        })
    }

    async fn replace(
        &self,
        package_id: &PackageId,
        data: &VersionListData,
        access_condition: &AccessCondition,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        match self
            .storage
            .put_raw(
                &Self::path(package_id),
                bytes.into(),
                access_condition.precondition(),
            )
            .await?
        {
            WriteResult::Success { .. } => {
                metrics::record_version_list_updated();
                Ok(())
            }
            WriteResult::PreconditionFailed { current_version } => {
                metrics::record_version_list_conflict();
                tracing::warn!(
                    package_id = %package_id,
                    current_version = %current_version,
                    "version list changed since it was read"
                );
                Err(SearchError::VersionListConflict {
                    package_id: package_id.as_str().to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use feedsync_core::MemoryBackend;

    fn client() -> StorageVersionListClient {
        StorageVersionListClient::new(
            ScopedStorage::new(Arc::new(MemoryBackend::new()), "state").expect("scope"),
        )
    }

    #[test]
    fn tracks_listed_versions() {
        let mut data = VersionListData::default();
        data.upsert("1.0.0", true);
        data.upsert("2.0.0", false);
        data.upsert("1.0.0", false);
        assert_eq!(data.listed_count(), 0);

        data.upsert("3.0.0", true);
        assert_eq!(data.listed().collect::<Vec<_>>(), vec!["3.0.0"]);
        assert!(data.remove("2.0.0"));
        assert!(!data.remove("2.0.0"));
    }

    #[tokio::test]
    async fn missing_list_reads_as_empty_if_not_exists() {
        let id = PackageId::new("Contoso.Lib").expect("id");
        let read = client().read(&id).await.expect("read");
        assert!(read.result.version_properties.is_empty());
        assert_eq!(read.access_condition, AccessCondition::IfNotExists);
    }

    #[tokio::test]
    async fn stale_access_condition_is_a_conflict() {
        let client = client();
        let id = PackageId::new("Contoso.Lib").expect("id");

        let first = client.read(&id).await.expect("read");
        let mut data = first.result.clone();
        data.upsert("1.0.0", true);
        client
            .replace(&id, &data, &first.access_condition)
            .await
            .expect("create");

        let err = client
            .replace(&id, &data, &first.access_condition)
            .await
            .expect_err("stale");
        assert!(matches!(err, SearchError::VersionListConflict { .. }));

        // Reads are case-insensitive on the id.
        let lower = PackageId::new("contoso.lib").expect("id");
        let second = client.read(&lower).await.expect("read");
        assert_eq!(second.result, data);
        client
            .replace(&lower, &data, &second.access_condition)
            .await
            .expect("update with fresh condition");
    }
}
