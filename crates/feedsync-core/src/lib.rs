//! # feedsync-core
//!
//! Shared primitives for the feedsync pipeline (feed, catalog, search index).
//!
//! - **Identity**: case-insensitive package ids and normalized versions
//! - **Storage**: the conditional-write backend contract, an in-memory backend,
//!   and a local file system backend
//! - **Scoped storage**: one backend shared by several logical stores
//! - **Errors**: the shared error type and defect classification
//! - **Observability**: logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use feedsync_core::prelude::*;
//!
//! let identity = PackageIdentity::new("Contoso.Lib", "1.0").unwrap();
//! assert_eq!(identity.version.as_str(), "1.0.0");
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod file_backend;
pub mod identity;
pub mod observability;
pub mod scoped_storage;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::file_backend::FileBackend;
    pub use crate::identity::{NormalizedVersion, PackageId, PackageIdentity};
    pub use crate::scoped_storage::ScopedStorage;
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult,
    };
}

pub use error::{Error, Result};
pub use file_backend::FileBackend;
pub use identity::{NormalizedVersion, PackageId, PackageIdentity};
pub use observability::{LogFormat, init_logging};
pub use scoped_storage::ScopedStorage;
pub use storage::{MemoryBackend, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};
