//! Scope-prefixed storage wrapper.
//!
//! Several logical stores share one backend: the catalog, the deletion audit
//! trail, the search cursor, version lists, and the monitoring queue. Each is
//! addressed through a [`ScopedStorage`] whose scope becomes the first path
//! segment, so that `ScopedStorage::new(backend, "catalog")` reads and writes
//! `catalog/{path}`.
//!
//! # Security
//!
//! - Scope names are validated at construction
//! - Path traversal attempts (`..`) are rejected
//! - Absolute paths, backslashes, and control characters are rejected

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Storage wrapper that prefixes every path with a fixed scope.
#[derive(Clone)]
pub struct ScopedStorage {
    backend: Arc<dyn StorageBackend>,
    scope: String,
}

impl fmt::Debug for ScopedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedStorage")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ScopedStorage {
    /// Creates a new scoped storage wrapper.
    ///
    /// # Errors
    ///
    /// Returns an error if `scope` is empty or contains characters outside
    /// `a-z`, `0-9`, `-`, `_`.
    pub fn new(backend: Arc<dyn StorageBackend>, scope: impl Into<String>) -> Result<Self> {
        let scope = scope.into();
        Self::validate_scope(&scope)?;
        Ok(Self { backend, scope })
    }

    fn validate_scope(scope: &str) -> Result<()> {
        if scope.is_empty() {
            return Err(Error::InvalidInput("scope cannot be empty".into()));
        }

        if !scope
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(Error::InvalidInput(format!(
                "scope '{scope}' contains invalid characters (allowed: a-z, 0-9, '-', '_')"
            )));
        }

        Ok(())
    }

    /// Validates a relative path for path traversal attacks.
    fn validate_path(path: &str) -> Result<()> {
        if path.starts_with('/') || path.starts_with('\\') {
            return Err(Error::InvalidInput(format!(
                "absolute paths not allowed: {path}"
            )));
        }

        if path.contains('\\') {
            return Err(Error::InvalidInput(format!(
                "backslashes not allowed in paths: {path}"
            )));
        }

        if path.contains('\n') || path.contains('\r') || path.contains('\0') {
            return Err(Error::InvalidInput(format!(
                "control characters not allowed in paths: {path}"
            )));
        }

        for segment in path.split('/') {
            if segment == "." || segment == ".." {
                return Err(Error::InvalidInput(format!(
                    "path traversal not allowed: {path}"
                )));
            }
        }

        Ok(())
    }

    /// Returns the scope name.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Returns the backend for advanced operations.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    fn scoped_path(&self, path: &str) -> String {
        format!("{}/{}", self.scope, path)
    }

    /// Reads an object by scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object doesn't exist, or a storage
    /// error if the read fails.
    pub async fn get_raw(&self, path: &str) -> Result<Bytes> {
        Self::validate_path(path)?;
        self.backend.get(&self.scoped_path(path)).await
    }

    /// Writes an object by scope-relative path with a precondition.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the write fails.
    pub async fn put_raw(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        Self::validate_path(path)?;
        self.backend
            .put(&self.scoped_path(path), data, precondition)
            .await
    }

    /// Deletes an object by scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the delete fails.
    pub async fn delete(&self, path: &str) -> Result<()> {
        Self::validate_path(path)?;
        self.backend.delete(&self.scoped_path(path)).await
    }

    /// Lists objects under a scope-relative prefix.
    ///
    /// Returned metadata carries scope-relative paths, in arbitrary order.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is invalid or the listing fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Self::validate_path(prefix)?;
        let scope_prefix = format!("{}/", self.scope);
        let metas = self.backend.list(&self.scoped_path(prefix)).await?;

        Ok(metas
            .into_iter()
            .filter_map(|m| {
                let relative = m.path.strip_prefix(&scope_prefix)?.to_string();
                Some(ObjectMeta {
                    path: relative,
                    ..m
                })
            })
            .collect())
    }

    /// Gets metadata for an object by scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is invalid or the lookup fails.
    pub async fn head_raw(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Self::validate_path(path)?;
        Ok(self
            .backend
            .head(&self.scoped_path(path))
            .await?
            .map(|m| ObjectMeta {
                path: path.to_string(),
                ..m
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn storage(scope: &str) -> ScopedStorage {
        ScopedStorage::new(Arc::new(MemoryBackend::new()), scope).expect("valid scope")
    }

    #[test]
    fn rejects_invalid_scopes() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        assert!(ScopedStorage::new(backend.clone(), "").is_err());
        assert!(ScopedStorage::new(backend.clone(), "Catalog").is_err());
        assert!(ScopedStorage::new(backend.clone(), "a/b").is_err());
        assert!(ScopedStorage::new(backend, "catalog-v3").is_ok());
    }

    #[tokio::test]
    async fn paths_are_prefixed_with_scope() {
        let backend = Arc::new(MemoryBackend::new());
        let scoped = ScopedStorage::new(backend.clone(), "catalog").expect("scope");

        scoped
            .put_raw("index.json", Bytes::from("{}"), WritePrecondition::None)
            .await
            .expect("put");

        assert!(
            backend
                .head("catalog/index.json")
                .await
                .expect("head")
                .is_some()
        );
        let meta = scoped
            .head_raw("index.json")
            .await
            .expect("head")
            .expect("exists");
        assert_eq!(meta.path, "index.json");
    }

    #[tokio::test]
    async fn list_returns_relative_paths_within_scope_only() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let catalog = ScopedStorage::new(backend.clone(), "catalog").expect("scope");
        let audit = ScopedStorage::new(backend, "audit").expect("scope");

        catalog
            .put_raw("data/a.json", Bytes::from("a"), WritePrecondition::None)
            .await
            .expect("put");
        audit
            .put_raw("data/b.json", Bytes::from("b"), WritePrecondition::None)
            .await
            .expect("put");

        let listed = catalog.list("data/").await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "data/a.json");
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let scoped = storage("catalog");
        assert!(scoped.get_raw("../audit/x.json").await.is_err());
        assert!(scoped.get_raw("/abs.json").await.is_err());
        assert!(scoped.get_raw("a\\b.json").await.is_err());
    }
}
