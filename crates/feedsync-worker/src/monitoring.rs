//! Package monitoring.
//!
//! Validation requests arrive on a queue with at-least-once delivery. For each
//! message the processor:
//!
//! 1. Resolves the catalog entries of the package (from the message, or the
//!    catalog when the message carries none)
//! 2. Skips the message if a status for newer catalog entries was already
//!    recorded
//! 3. Validates and records a `valid` or `invalid` status
//!
//! If validation itself fails, a `failed` status is recorded instead. The
//! message is removed only once some status was recorded, so a message whose
//! status could not be saved is delivered again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use feedsync_catalog::{CatalogCommitItem, CatalogError, CatalogReader};
use feedsync_core::{PackageIdentity, ScopedStorage, WritePrecondition, WriteResult};

use crate::error::{Result, SyncError};
use crate::metrics;

const MESSAGES_PREFIX: &str = "messages/";

/// Reference to one catalog commit of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    /// Commit id.
    pub commit_id: String,
    /// Commit timestamp.
    pub commit_timestamp: DateTime<Utc>,
}

impl From<&CatalogCommitItem> for CatalogEntry {
    fn from(item: &CatalogCommitItem) -> Self {
        Self {
            commit_id: item.commit_id().to_string(),
            commit_timestamp: item.commit_timestamp(),
        }
    }
}

fn newest(entries: &[CatalogEntry]) -> Option<DateTime<Utc>> {
    entries.iter().map(|e| e.commit_timestamp).max()
}

/// A validation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageValidatorContext {
    /// Package to validate.
    pub package: PackageIdentity,
    /// Catalog entries that triggered the request; empty if unknown.
    #[serde(default)]
    pub catalog_entries: Vec<CatalogEntry>,
}

/// A dequeued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Message id, unique within the queue.
    pub id: String,
    /// Message body.
    pub contents: PackageValidatorContext,
}

/// Consumer side of the validation queue.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Returns the next message not yet handed out, or `None` if the queue
    /// is drained.
    async fn get_next(&self) -> Result<Option<QueueMessage>>;

    /// Removes a handled message.
    async fn remove(&self, message: &QueueMessage) -> Result<()>;
}

fn poisoned<T>(_: PoisonError<T>) -> SyncError {
    SyncError::monitoring("queue lease lock poisoned")
}

/// Queue of JSON messages in a storage scope, delivered oldest first.
///
/// Messages handed out by `get_next` are leased until removed; a drained
/// queue releases its leases so that unremoved messages are delivered again.
#[derive(Debug)]
pub struct StorageQueue {
    storage: ScopedStorage,
    leased: Mutex<HashSet<String>>,
}

impl StorageQueue {
    /// Creates a queue over `storage`.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self {
            storage,
            leased: Mutex::new(HashSet::new()),
        }
    }

    fn path(id: &str) -> String {
        format!("{MESSAGES_PREFIX}{id}.json")
    }

    /// Adds a message and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be written.
    pub async fn enqueue(&self, contents: &PackageValidatorContext) -> Result<String> {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let id = format!("{nanos:020}-{}", Uuid::new_v4().simple());
        let bytes = serde_json::to_vec(contents)?;

        match self
            .storage
            .put_raw(&Self::path(&id), bytes.into(), WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(id),
            WriteResult::PreconditionFailed { .. } => Err(SyncError::monitoring(format!(
                "queue message {id} already exists"
            ))),
        }
    }

    /// Messages currently stored, leased or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.storage.list(MESSAGES_PREFIX).await?.len())
    }

    /// Returns true if no message is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[async_trait]
impl QueueConsumer for StorageQueue {
    async fn get_next(&self) -> Result<Option<QueueMessage>> {
        let mut ids: Vec<String> = self
            .storage
            .list(MESSAGES_PREFIX)
            .await?
            .into_iter()
            .filter_map(|meta| {
                meta.path
                    .strip_prefix(MESSAGES_PREFIX)?
                    .strip_suffix(".json")
                    .map(str::to_string)
            })
            .collect();
        ids.sort();

        for id in ids {
            if !self.leased.lock().map_err(poisoned)?.insert(id.clone()) {
                continue;
            }

            let bytes = match self.storage.get_raw(&Self::path(&id)).await {
                Ok(bytes) => bytes,
                // Removed by another consumer since the listing.
                Err(feedsync_core::Error::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice(&bytes) {
                Ok(contents) => return Ok(Some(QueueMessage { id, contents })),
                Err(e) => {
                    tracing::warn!(message_id = %id, error = %e, "skipping unreadable queue message");
                }
            }
        }

        self.leased.lock().map_err(poisoned)?.clear();
        Ok(None)
    }

    async fn remove(&self, message: &QueueMessage) -> Result<()> {
        self.storage.delete(&Self::path(&message.id)).await?;
        self.leased.lock().map_err(poisoned)?.remove(&message.id);
        Ok(())
    }
}

/// Outcome of validating a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PackageState {
    /// Every check passed.
    Valid,
    /// At least one check failed.
    Invalid,
    /// Validation could not run.
    Failed,
}

/// Recorded monitoring status of one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMonitoringStatus {
    /// The package.
    pub package: PackageIdentity,
    /// Validation outcome.
    pub state: PackageState,
    /// Catalog entries the status was computed for.
    #[serde(default)]
    pub catalog_entries: Vec<CatalogEntry>,
    /// Check failures, or the error that prevented validation.
    #[serde(default)]
    pub errors: Vec<String>,
    /// When the status was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Statuses in a storage scope, one JSON document per identity.
#[derive(Debug, Clone)]
pub struct StatusStore {
    storage: ScopedStorage,
}

impl StatusStore {
    /// Creates a store over `storage`.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self { storage }
    }

    fn path(package: &PackageIdentity) -> String {
        format!("status/{}/{}.json", package.id.key(), package.version.key())
    }

    /// Reads the status of `package`.
    ///
    /// # Errors
    ///
    /// Returns an error if the status exists but cannot be read.
    pub async fn get(&self, package: &PackageIdentity) -> Result<Option<PackageMonitoringStatus>> {
        match self.storage.get_raw(&Self::path(package)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(feedsync_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the status of its package.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be written.
    pub async fn put(&self, status: &PackageMonitoringStatus) -> Result<()> {
        let bytes = serde_json::to_vec(status)?;
        self.storage
            .put_raw(&Self::path(&status.package), bytes.into(), WritePrecondition::None)
            .await?;
        Ok(())
    }
}

/// Check failures found by a validator; empty when the package is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// One message per failed check.
    pub errors: Vec<String>,
}

/// Validates a package against its catalog entries.
#[async_trait]
pub trait PackageValidator: Send + Sync {
    /// Runs the checks. An `Err` means the checks could not run.
    async fn validate(&self, context: &PackageValidatorContext) -> Result<ValidationResult>;
}

/// Checks that the catalog's latest item for a package is consistent with
/// the request.
#[derive(Debug, Clone)]
pub struct CatalogLeafValidator {
    reader: CatalogReader,
}

impl CatalogLeafValidator {
    /// Creates a validator reading the catalog in `catalog`.
    #[must_use]
    pub fn new(catalog: ScopedStorage) -> Self {
        Self {
            reader: CatalogReader::new(catalog),
        }
    }
}

#[async_trait]
impl PackageValidator for CatalogLeafValidator {
    async fn validate(&self, context: &PackageValidatorContext) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let package = &context.package;

        let items = catalog_items_for(&self.reader, package).await?;
        let Some(latest) = items.last() else {
            errors.push(format!("{package} is missing from the catalog"));
            return Ok(ValidationResult { errors });
        };

        if let Some(requested) = newest(&context.catalog_entries) {
            if requested > latest.commit_timestamp() {
                errors.push(format!(
                    "catalog is behind the requested commit {}",
                    requested.to_rfc3339()
                ));
            }
        }
        if latest.is_delete() {
            return Ok(ValidationResult { errors });
        }

        match self.reader.read_leaf(latest).await {
            Ok(leaf) => {
                let id = leaf.get("id").and_then(serde_json::Value::as_str);
                if !id.is_some_and(|id| id.eq_ignore_ascii_case(package.id.as_str())) {
                    errors.push(format!("leaf id {id:?} does not match {}", package.id));
                }
                let version = leaf.get("version").and_then(serde_json::Value::as_str);
                if !version.is_some_and(|v| v.eq_ignore_ascii_case(package.version.as_str())) {
                    errors.push(format!(
                        "leaf version {version:?} does not match {}",
                        package.version
                    ));
                }
            }
            Err(CatalogError::NotFound { .. }) => {
                errors.push(format!("leaf {} is missing", latest.location()));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(ValidationResult { errors })
    }
}

async fn catalog_items_for(
    reader: &CatalogReader,
    package: &PackageIdentity,
) -> Result<Vec<CatalogCommitItem>> {
    Ok(reader
        .items_since(None)
        .await?
        .into_iter()
        .filter(|item| item.identity() == package)
        .collect())
}

/// Messages handled by one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    /// Validated and recorded as valid or invalid.
    pub validated: usize,
    /// Skipped because a newer status exists.
    pub skipped: usize,
    /// Recorded as failed.
    pub failed: usize,
    /// Left in the queue because no status could be recorded.
    pub unremoved: usize,
}

impl ProcessSummary {
    /// Messages removed from the queue.
    #[must_use]
    pub fn handled(&self) -> usize {
        self.validated + self.skipped + self.failed
    }
}

enum Outcome {
    Validated,
    Skipped,
}

/// Drains the validation queue.
pub struct MonitoringProcessor {
    queue: Arc<dyn QueueConsumer>,
    validator: Arc<dyn PackageValidator>,
    statuses: StatusStore,
    reader: CatalogReader,
}

impl std::fmt::Debug for MonitoringProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringProcessor")
            .field("statuses", &self.statuses)
            .finish_non_exhaustive()
    }
}

impl MonitoringProcessor {
    /// Creates a processor. Catalog entries missing from a message are
    /// looked up in `catalog`.
    #[must_use]
    pub fn new(
        queue: Arc<dyn QueueConsumer>,
        validator: Arc<dyn PackageValidator>,
        statuses: StatusStore,
        catalog: ScopedStorage,
    ) -> Self {
        Self {
            queue,
            validator,
            statuses,
            reader: CatalogReader::new(catalog),
        }
    }

    /// Handles messages until the queue is drained or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns queue errors. Validation errors are recorded as failed
    /// statuses instead.
    pub async fn process_all(&self, cancel: &CancellationToken) -> Result<ProcessSummary> {
        let mut summary = ProcessSummary::default();
        while !cancel.is_cancelled() {
            tracing::debug!("fetching next queue message");
            let Some(message) = self.queue.get_next().await? else {
                break;
            };
            self.handle(&message, &mut summary).await?;
        }

        tracing::info!(
            validated = summary.validated,
            skipped = summary.skipped,
            failed = summary.failed,
            unremoved = summary.unremoved,
            "monitoring queue drained"
        );
        Ok(summary)
    }

    async fn handle(&self, message: &QueueMessage, summary: &mut ProcessSummary) -> Result<()> {
        let package = &message.contents.package;
        match self.run_validator(&message.contents).await {
            Ok(Outcome::Validated) => {
                summary.validated += 1;
                metrics::record_monitoring_message("validated");
            }
            Ok(Outcome::Skipped) => {
                summary.skipped += 1;
                metrics::record_monitoring_message("skipped");
            }
            Err(e) => {
                tracing::warn!(package = %package, error = %e, "validation failed to run");
                let status = PackageMonitoringStatus {
                    package: package.clone(),
                    state: PackageState::Failed,
                    catalog_entries: message.contents.catalog_entries.clone(),
                    errors: vec![e.to_string()],
                    recorded_at: Utc::now(),
                };
                if let Err(save) = self.statuses.put(&status).await {
                    tracing::error!(
                        package = %package,
                        message_id = %message.id,
                        error = %save,
                        "could not record failed status; leaving message in the queue"
                    );
                    summary.unremoved += 1;
                    metrics::record_monitoring_message("unremoved");
                    return Ok(());
                }
                summary.failed += 1;
                metrics::record_monitoring_message("failed");
            }
        }

        self.queue.remove(message).await
    }

    async fn run_validator(&self, queued: &PackageValidatorContext) -> Result<Outcome> {
        let package = &queued.package;
        tracing::info!(package = %package, "running package validator");

        let catalog_entries = if queued.catalog_entries.is_empty() {
            tracing::info!(
                package = %package,
                "message has no catalog entries; using the catalog"
            );
            let entries: Vec<CatalogEntry> = catalog_items_for(&self.reader, package)
                .await?
                .iter()
                .map(CatalogEntry::from)
                .collect();
            if entries.is_empty() {
                return Err(SyncError::monitoring(format!(
                    "{package} is missing from the catalog"
                )));
            }
            entries
        } else {
            queued.catalog_entries.clone()
        };

        if let Some(existing) = self.statuses.get(package).await? {
            if let (Some(requested), Some(recorded)) =
                (newest(&catalog_entries), newest(&existing.catalog_entries))
            {
                if requested < recorded {
                    tracing::info!(
                        package = %package,
                        requested = %requested.to_rfc3339(),
                        recorded = %recorded.to_rfc3339(),
                        "newer catalog entry already validated"
                    );
                    return Ok(Outcome::Skipped);
                }
            }
        }

        let context = PackageValidatorContext {
            package: package.clone(),
            catalog_entries,
        };
        let result = self.validator.validate(&context).await?;
        let state = if result.errors.is_empty() {
            PackageState::Valid
        } else {
            PackageState::Invalid
        };
        self.statuses
            .put(&PackageMonitoringStatus {
                package: context.package,
                state,
                catalog_entries: context.catalog_entries,
                errors: result.errors,
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(Outcome::Validated)
    }
}
