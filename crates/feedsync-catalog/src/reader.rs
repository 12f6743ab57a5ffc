//! Catalog reader.
//!
//! Reads only through the root, so a reader never observes leaves or pages
//! written by a commit whose root swap did not land.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use feedsync_core::ScopedStorage;

use crate::commit_item::CatalogCommitItem;
use crate::error::{CatalogError, Result};
use crate::manifest::{CatalogPage, CatalogRoot, paths};
use crate::watermark::Watermark;

/// The catalog root together with the storage version it was read at.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    /// Root document.
    pub root: CatalogRoot,
    /// Storage version of the root, `None` when the catalog is empty.
    pub version: Option<String>,
}

/// Read access to a catalog.
#[derive(Debug, Clone)]
pub struct CatalogReader {
    storage: ScopedStorage,
}

impl CatalogReader {
    /// Creates a reader over the catalog scope.
    #[must_use]
    pub fn new(storage: ScopedStorage) -> Self {
        Self { storage }
    }

    /// Loads the current root. A missing root is an empty catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be read or parsed.
    pub async fn load(&self) -> Result<CatalogSnapshot> {
        load_root(&self.storage).await
    }

    /// Returns the watermark persisted by the last commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be read or parsed.
    pub async fn watermark(&self) -> Result<Watermark> {
        Ok(self.load().await?.root.watermark)
    }

    /// Returns every item committed strictly after `cursor`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read or an entry fails validation.
    pub async fn items_since(
        &self,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<CatalogCommitItem>> {
        let snapshot = self.load().await?;
        self.items_in(&snapshot.root, cursor).await
    }

    /// Returns items of `root` committed strictly after `cursor`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read or an entry fails validation.
    pub async fn items_in(
        &self,
        root: &CatalogRoot,
        cursor: Option<DateTime<Utc>>,
    ) -> Result<Vec<CatalogCommitItem>> {
        let after = |at: DateTime<Utc>| cursor.is_none_or(|c| at > c);

        let mut items = Vec::new();
        for page_ref in root.pages.iter().filter(|p| after(p.commit_timestamp)) {
            let page: CatalogPage = read_json(&self.storage, &page_ref.path).await?;
            for entry in page.items.iter().filter(|e| after(e.commit_timestamp)) {
                items.push(CatalogCommitItem::from_page_entry(entry)?);
            }
        }

        items.sort();
        Ok(items)
    }

    /// Reads the leaf document of an item.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::NotFound` if the leaf is missing.
    pub async fn read_leaf(&self, item: &CatalogCommitItem) -> Result<serde_json::Value> {
        read_json(&self.storage, item.location()).await
    }
}

pub(crate) async fn load_root(storage: &ScopedStorage) -> Result<CatalogSnapshot> {
    let Some(meta) = storage.head_raw(paths::ROOT).await? else {
        return Ok(CatalogSnapshot {
            root: CatalogRoot::empty(),
            version: None,
        });
    };

    let root = read_json(storage, paths::ROOT).await?;
    Ok(CatalogSnapshot {
        root,
        version: Some(meta.version),
    })
}

pub(crate) async fn read_json<T: DeserializeOwned>(storage: &ScopedStorage, path: &str) -> Result<T> {
    let bytes = storage.get_raw(path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CatalogError::serialization(format!("parse JSON at {path}: {e}")))
}

pub(crate) fn json_bytes<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| CatalogError::serialization(format!("serialize JSON: {e}")))
}
