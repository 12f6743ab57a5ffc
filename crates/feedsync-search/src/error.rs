//! Error types for feedsync-search operations.

use feedsync_catalog::CatalogError;
use thiserror::Error;

/// Result type alias for search publication operations.
pub type Result<T> = std::result::Result<T, SearchError>;

/// Errors that can occur while publishing to the search index.
#[derive(Debug, Error)]
pub enum SearchError {
    /// A package id was enqueued twice in one batch pusher cycle.
    #[error("package id already enqueued: {package_id}")]
    AlreadyEnqueued {
        /// The repeated package id.
        package_id: String,
    },

    /// An enqueue carried no index actions.
    #[error("no index actions for package id {package_id}")]
    NoIndexActions {
        /// The package id.
        package_id: String,
    },

    /// A batch larger than the configured batch size reached the index.
    #[error("batch of {size} exceeds the batch size of {limit}")]
    BatchTooLarge {
        /// Actions in the batch.
        size: usize,
        /// Configured batch size.
        limit: usize,
    },

    /// The index rejected one or more documents of a batch.
    #[error("{error_count} errors indexing a batch into {index}")]
    IndexingFailed {
        /// Logical index name.
        index: String,
        /// Number of rejected documents.
        error_count: usize,
    },

    /// A version list changed since it was read.
    #[error("version list for {package_id} changed since it was read")]
    VersionListConflict {
        /// The package id.
        package_id: String,
    },

    /// The publication cursor changed since it was read.
    #[error("cursor conflict: {message}")]
    CursorConflict {
        /// Description of the conflict.
        message: String,
    },

    /// Storage or index backend failure.
    #[error("backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },

    /// Serialization/deserialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Reading the catalog failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// An internal invariant was violated.
    #[error("invariant violated: {message}")]
    Invariant {
        /// Description of the violated invariant.
        message: String,
    },
}

impl SearchError {
    /// Creates a backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates an invariant error.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    /// Returns true if the error is a programming defect that must not be
    /// retried.
    #[must_use]
    pub fn is_defect(&self) -> bool {
        match self {
            Self::AlreadyEnqueued { .. }
            | Self::NoIndexActions { .. }
            | Self::BatchTooLarge { .. }
            | Self::Invariant { .. } => true,
            Self::Catalog(err) => err.is_defect(),
            _ => false,
        }
    }
}

impl From<feedsync_core::Error> for SearchError {
    fn from(err: feedsync_core::Error) -> Self {
        use feedsync_core::Error as Core;
        match err {
            Core::Serialization { message } => Self::Serialization { message },
            Core::InvalidInput(message) | Core::Internal { message } => Self::Invariant { message },
            other => Self::Backend {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for SearchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
