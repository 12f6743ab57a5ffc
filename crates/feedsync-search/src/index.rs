//! Logical indexes, index actions, and the index client contract.
//!
//! Two logical indexes receive actions:
//! - `search`: one document per package id, describing the listed versions
//! - `hijack`: one document per package version
//!
//! The client contract reports per-document outcomes; a batch call that
//! returns is not necessarily a batch that fully succeeded.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use feedsync_core::{ScopedStorage, WritePrecondition};

use crate::error::{Result, SearchError};
use crate::version_list::{ResultAndAccessCondition, VersionListData};

/// One of the fixed downstream indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalIndex {
    /// Package-level documents.
    Search,
    /// Version-level documents.
    Hijack,
}

impl LogicalIndex {
    /// Stable index name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Hijack => "hijack",
        }
    }
}

impl fmt::Display for LogicalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an action does to its document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexActionKind {
    /// Replace the document.
    Upload,
    /// Merge fields into the document, creating it if missing.
    MergeOrUpload,
    /// Remove the document.
    Delete,
}

/// A single index mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexAction {
    /// What the action does.
    pub kind: IndexActionKind,
    /// Document key.
    pub key: String,
    /// Document body; `Null` for deletes.
    #[serde(default)]
    pub document: Value,
}

impl IndexAction {
    /// Upload (replace) `document` under `key`.
    #[must_use]
    pub fn upload(key: impl Into<String>, document: Value) -> Self {
        Self {
            kind: IndexActionKind::Upload,
            key: key.into(),
            document,
        }
    }

    /// Merge `document` into `key`.
    #[must_use]
    pub fn merge_or_upload(key: impl Into<String>, document: Value) -> Self {
        Self {
            kind: IndexActionKind::MergeOrUpload,
            key: key.into(),
            document,
        }
    }

    /// Delete `key`.
    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: IndexActionKind::Delete,
            key: key.into(),
            document: Value::Null,
        }
    }
}

/// All actions for one package id, plus the version list to write once they
/// have landed.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexActions {
    /// Actions for the search index.
    pub search: Vec<IndexAction>,
    /// Actions for the hijack index.
    pub hijack: Vec<IndexAction>,
    /// Updated version list and the access condition it was read under.
    pub version_list: ResultAndAccessCondition<VersionListData>,
}

impl IndexActions {
    /// Total actions across both indexes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.search.len() + self.hijack.len()
    }

    /// Returns true if there are no actions for either index.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.search.is_empty() && self.hijack.is_empty()
    }
}

/// Outcome of one action in a submitted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexingResult {
    /// Document key.
    pub key: String,
    /// Whether the action was applied.
    pub succeeded: bool,
    /// HTTP-style status code.
    pub status_code: u16,
    /// Error detail for failed actions.
    pub error_message: Option<String>,
}

impl IndexingResult {
    /// A successful result.
    #[must_use]
    pub fn ok(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            succeeded: true,
            status_code: 200,
            error_message: None,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(key: impl Into<String>, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            succeeded: false,
            status_code,
            error_message: Some(message.into()),
        }
    }
}

/// Client for one logical index.
#[async_trait]
pub trait SearchIndexClient: Send + Sync {
    /// Name of the index, for logs.
    fn index_name(&self) -> &str;

    /// Submits a batch and returns one result per action.
    ///
    /// # Errors
    ///
    /// Returns an error if the request as a whole failed.
    async fn index(&self, batch: Vec<IndexAction>) -> Result<Vec<IndexingResult>>;
}

fn apply(documents: &mut BTreeMap<String, Value>, action: IndexAction) {
    match action.kind {
        IndexActionKind::Upload => {
            documents.insert(action.key, action.document);
        }
        IndexActionKind::MergeOrUpload => {
            let entry = documents
                .entry(action.key)
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            match (entry, action.document) {
                (Value::Object(existing), Value::Object(fields)) => existing.extend(fields),
                (entry, document) => *entry = document,
            }
        }
        IndexActionKind::Delete => {
            documents.remove(&action.key);
        }
    }
}

fn poisoned<T>(_: PoisonError<T>) -> SearchError {
    SearchError::backend("in-memory index lock poisoned")
}

/// In-memory index. Keys can be marked as rejected to simulate per-document
/// failures; a batch containing a rejected key is not applied at all.
#[derive(Debug)]
pub struct InMemorySearchIndex {
    name: String,
    documents: Mutex<BTreeMap<String, Value>>,
    rejected: Mutex<HashSet<String>>,
    batches: Mutex<Vec<usize>>,
}

impl InMemorySearchIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(index: LogicalIndex) -> Self {
        Self {
            name: index.as_str().to_string(),
            documents: Mutex::new(BTreeMap::new()),
            rejected: Mutex::new(HashSet::new()),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Makes every later action on `key` fail.
    pub fn reject(&self, key: impl Into<String>) {
        if let Ok(mut rejected) = self.rejected.lock() {
            rejected.insert(key.into());
        }
    }

    /// Returns the stored document for `key`.
    #[must_use]
    pub fn document(&self, key: &str) -> Option<Value> {
        self.documents.lock().ok()?.get(key).cloned()
    }

    /// Returns the number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.lock().map_or(0, |d| d.len())
    }

    /// Returns true if the index holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the size of every batch received, in order.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SearchIndexClient for InMemorySearchIndex {
    fn index_name(&self) -> &str {
        &self.name
    }

    async fn index(&self, batch: Vec<IndexAction>) -> Result<Vec<IndexingResult>> {
        self.batches.lock().map_err(poisoned)?.push(batch.len());

        let rejected = self.rejected.lock().map_err(poisoned)?.clone();
        let results: Vec<IndexingResult> = batch
            .iter()
            .map(|action| {
                if rejected.contains(&action.key) {
                    IndexingResult::failed(&action.key, 400, "document rejected")
                } else {
                    IndexingResult::ok(&action.key)
                }
            })
            .collect();

        if results.iter().all(|r| r.succeeded) {
            let mut documents = self.documents.lock().map_err(poisoned)?;
            for action in batch {
                apply(&mut documents, action);
            }
        }
        Ok(results)
    }
}

/// Index that persists each document as a JSON object in a storage scope,
/// under `{index}/{key}.json`.
#[derive(Debug, Clone)]
pub struct StorageSearchIndex {
    name: String,
    storage: ScopedStorage,
}

impl StorageSearchIndex {
    /// Creates an index named after `index` in `storage`.
    #[must_use]
    pub fn new(storage: ScopedStorage, index: LogicalIndex) -> Self {
        Self {
            name: index.as_str().to_string(),
            storage,
        }
    }

    fn path(&self, key: &str) -> String {
        format!("{}/{key}.json", self.name)
    }

    /// Reads the stored document for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails for a reason other than absence.
    pub async fn document(&self, key: &str) -> Result<Option<Value>> {
        match self.storage.get_raw(&self.path(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(feedsync_core::Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(&self, action: IndexAction) -> IndexingResult {
        let key = action.key.clone();
        let outcome = async {
            let mut documents = BTreeMap::new();
            if let Some(existing) = self.document(&key).await? {
                documents.insert(key.clone(), existing);
            }
            apply(&mut documents, action);

            match documents.remove(&key) {
                Some(document) => {
                    let bytes = serde_json::to_vec(&document)?;
                    self.storage
                        .put_raw(&self.path(&key), bytes.into(), WritePrecondition::None)
                        .await?;
                }
                None => self.storage.delete(&self.path(&key)).await?,
            }
            Ok::<_, SearchError>(())
        }
        .await;

        match outcome {
            Ok(()) => IndexingResult::ok(key),
            Err(e) => IndexingResult::failed(key, 500, e.to_string()),
        }
    }
}

#[async_trait]
impl SearchIndexClient for StorageSearchIndex {
    fn index_name(&self) -> &str {
        &self.name
    }

    async fn index(&self, batch: Vec<IndexAction>) -> Result<Vec<IndexingResult>> {
        let mut results = Vec::with_capacity(batch.len());
        for action in batch {
            results.push(self.apply(action).await);
        }
        Ok(results)
    }
}
