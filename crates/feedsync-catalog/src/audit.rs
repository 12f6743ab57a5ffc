//! Storage-backed deletion audit trail.
//!
//! Each deletion is one JSON record in the audit scope, named
//! `{yyyy-MM-ddTHH-mm-ss.fffffffffZ}-{id}-{version}.json` after the instant it
//! was written. Listing therefore filters by name before any record is read.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use feedsync_core::{PackageIdentity, ScopedStorage, WritePrecondition, WriteResult};

use crate::delta::{DeletionAuditEntry, DeletionAuditSource};
use crate::error::{CatalogError, Result};
use crate::metrics;
use crate::reader::{json_bytes, read_json};

const NAME_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.9fZ";
const NAME_TIMESTAMP_LEN: usize = 30;

/// One persisted audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// The package affected.
    pub record: AuditedPackage,
    /// Who acted, and when.
    pub actor: AuditActor,
}

/// Package section of an audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditedPackage {
    /// Package id; may be empty in malformed records.
    #[serde(default)]
    pub id: String,
    /// Package version; may be empty in malformed records.
    #[serde(default)]
    pub version: String,
}

/// Actor section of an audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditActor {
    /// When the deletion happened.
    pub timestamp_utc: DateTime<Utc>,
}

/// [`DeletionAuditSource`] reading records from a storage scope.
#[derive(Debug, Clone)]
pub struct StorageAuditSource {
    storage: ScopedStorage,
}

impl StorageAuditSource {
    /// Creates an audit source over `storage`.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self { storage }
    }

    /// Appends a deletion record written at `written_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if a record with the same name already exists or the
    /// write fails.
    pub async fn record_delete(
        &self,
        identity: &PackageIdentity,
        deleted_at: DateTime<Utc>,
        written_at: DateTime<Utc>,
    ) -> Result<String> {
        let name = format!(
            "{}-{}-{}.json",
            written_at.format(NAME_TIMESTAMP_FORMAT),
            identity.id.key(),
            identity.version.key()
        );
        let record = AuditRecord {
            record: AuditedPackage {
                id: identity.id.as_str().to_string(),
                version: identity.version.as_str().to_string(),
            },
            actor: AuditActor {
                timestamp_utc: deleted_at,
            },
        };

        match self
            .storage
            .put_raw(&name, json_bytes(&record)?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(name),
            WriteResult::PreconditionFailed { .. } => Err(CatalogError::CasFailed {
                message: format!("audit record already exists: {name}"),
            }),
        }
    }
}

fn name_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let prefix = name.get(..NAME_TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(prefix, NAME_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[async_trait]
impl DeletionAuditSource for StorageAuditSource {
    async fn get_deleted_since(&self, since: DateTime<Utc>) -> Result<Vec<DeletionAuditEntry>> {
        let listed = self.storage.list("").await.inspect_err(|_| {
            metrics::record_fetch_error("audit");
        })?;

        let mut names: Vec<String> = listed
            .into_iter()
            .filter(|meta| {
                std::path::Path::new(&meta.path)
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
            })
            .filter(|meta| name_timestamp(&meta.path).is_some_and(|written| written > since))
            .map(|meta| meta.path)
            .collect();
        names.sort();

        let mut entries = Vec::new();
        for name in names {
            let record: AuditRecord = read_json(&self.storage, &name).await?;
            if record.record.id.is_empty() || record.record.version.is_empty() {
                tracing::debug!(record = %name, "skipping audit record without identity");
                continue;
            }
            if record.actor.timestamp_utc <= since {
                continue;
            }

            match PackageIdentity::new(&record.record.id, &record.record.version) {
                Ok(identity) => entries.push(DeletionAuditEntry {
                    identity,
                    timestamp: record.actor.timestamp_utc,
                }),
                Err(e) => {
                    tracing::warn!(record = %name, error = %e, "skipping audit record with invalid identity");
                }
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bytes::Bytes;
    use chrono::{Duration, TimeZone};
    use feedsync_core::MemoryBackend;

    fn source() -> (StorageAuditSource, ScopedStorage) {
        let storage =
            ScopedStorage::new(Arc::new(MemoryBackend::new()), "audit").expect("scope");
        (StorageAuditSource::new(storage.clone()), storage)
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, minute, 0)
            .single()
            .expect("valid")
    }

    #[test]
    fn name_timestamp_roundtrips() {
        let written = at(5) + Duration::nanoseconds(42);
        let name = format!("{}-a-1.0.0.json", written.format(NAME_TIMESTAMP_FORMAT));
        assert_eq!(name_timestamp(&name), Some(written));
        assert_eq!(name_timestamp("readme.json"), None);
    }

    #[tokio::test]
    async fn returns_records_after_since() {
        let (audit, _) = source();
        let a = PackageIdentity::new("A", "1.0.0").expect("identity");
        let b = PackageIdentity::new("B", "1.0.0").expect("identity");

        audit.record_delete(&a, at(1), at(1)).await.expect("write");
        audit.record_delete(&b, at(10), at(11)).await.expect("write");

        let entries = audit.get_deleted_since(at(5)).await.expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].identity, b);
        assert_eq!(entries[0].timestamp, at(10));
    }

    #[tokio::test]
    async fn skips_records_without_identity() {
        let (audit, storage) = source();
        let name = format!("{}-blank.json", at(3).format(NAME_TIMESTAMP_FORMAT));
        let record = serde_json::json!({
            "record": {"id": "", "version": "1.0.0"},
            "actor": {"timestampUtc": at(3).to_rfc3339()}
        });
        storage
            .put_raw(
                &name,
                Bytes::from(record.to_string()),
                WritePrecondition::None,
            )
            .await
            .expect("write");

        assert!(audit.get_deleted_since(at(0)).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn duplicate_records_are_both_returned() {
        let (audit, _) = source();
        let a = PackageIdentity::new("A", "1.0.0").expect("identity");
        audit.record_delete(&a, at(2), at(2)).await.expect("write");
        audit
            .record_delete(&a, at(2), at(2) + Duration::milliseconds(1))
            .await
            .expect("write");

        assert_eq!(audit.get_deleted_since(at(0)).await.expect("read").len(), 2);
    }
}
