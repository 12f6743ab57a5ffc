//! Local file system storage backend.
//!
//! Objects live at `{root}/{path}`. Version tokens are the SHA-256 of the
//! object content, so a CAS against the file system compares content hashes.
//! Writes go to a temporary sibling and are renamed into place, which makes
//! each individual object write atomic for readers.
//!
//! Conditional writes are serialized through a process-local mutex. Two
//! processes sharing one directory are not supported.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

const TEMP_SUFFIX: &str = ".tmp-write";

/// Storage backend rooted at a local directory.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Creates a backend rooted at `root`. The directory is created lazily on
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() || path.starts_with('/') || path.contains('\\') {
            return Err(Error::InvalidInput(format!("invalid object path: {path}")));
        }
        if path.split('/').any(|segment| segment == ".." || segment == ".") {
            return Err(Error::InvalidInput(format!(
                "path traversal not allowed: {path}"
            )));
        }
        Ok(self.root.join(path))
    }

    async fn read_optional(&self, full: &Path) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(full).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("read {}", full.display()),
                e,
            )),
        }
    }

    async fn meta_for(&self, path: &str, full: &Path) -> Result<Option<ObjectMeta>> {
        let Some(data) = self.read_optional(full).await? else {
            return Ok(None);
        };
        let last_modified = tokio::fs::metadata(full)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        Ok(Some(ObjectMeta {
            path: path.to_string(),
            size: data.len() as u64,
            version: content_version(&data),
            last_modified,
        }))
    }
}

fn content_version(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let full = self.resolve(path)?;
        self.read_optional(&full)
            .await?
            .map(Bytes::from)
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let full = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;

        let current = self.read_optional(&full).await?;
        let current_version = current.as_deref().map(content_version);

        match (&precondition, &current_version) {
            (WritePrecondition::DoesNotExist, Some(existing)) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: existing.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(expected), Some(existing))
                if expected != existing =>
            {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: existing.clone(),
                });
            }
            (WritePrecondition::MatchesVersion(_), None) => {
                return Ok(WriteResult::PreconditionFailed {
                    current_version: String::new(),
                });
            }
            _ => {}
        }

        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage_with_source(format!("create {}", parent.display()), e)
            })?;
        }

        let mut temp = full.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, &data)
            .await
            .map_err(|e| Error::storage_with_source(format!("write {}", temp.display()), e))?;
        tokio::fs::rename(&temp, &full)
            .await
            .map_err(|e| Error::storage_with_source(format!("rename {}", full.display()), e))?;

        Ok(WriteResult::Success {
            version: content_version(&data),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("delete {}", full.display()),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut results = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("list {}", dir.display()),
                        e,
                    ));
                }
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::storage_with_source(format!("list {}", dir.display()), e))?
            {
                let entry_path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::storage_with_source("stat entry", e))?;
                if file_type.is_dir() {
                    pending.push(entry_path);
                    continue;
                }

                let Ok(relative) = entry_path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(TEMP_SUFFIX) || !key.starts_with(prefix) {
                    continue;
                }
                if let Some(meta) = self.meta_for(&key, &entry_path).await? {
                    results.push(meta);
                }
            }
        }

        Ok(results)
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let full = self.resolve(path)?;
        self.meta_for(path, &full).await
    }
}
