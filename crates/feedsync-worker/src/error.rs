//! Error types for the worker jobs.

use feedsync_catalog::CatalogError;
use feedsync_search::SearchError;
use thiserror::Error;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by a job run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The feed-to-catalog cycle failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Search publication failed.
    #[error(transparent)]
    Search(#[from] SearchError),

    /// Storage access outside the catalog and search layers failed.
    #[error(transparent)]
    Storage(#[from] feedsync_core::Error),

    /// A monitoring queue message could not be handled.
    #[error("monitoring error: {message}")]
    Monitoring {
        /// Description of the failure.
        message: String,
    },

    /// The worker was started with an unusable configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },
}

impl SyncError {
    /// Creates a monitoring error.
    #[must_use]
    pub fn monitoring(message: impl Into<String>) -> Self {
        Self::Monitoring {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if the error is a defect: the process must exit instead of
    /// retrying on the next interval.
    #[must_use]
    pub fn is_defect(&self) -> bool {
        match self {
            Self::Catalog(err) => err.is_defect(),
            Self::Search(err) => err.is_defect(),
            Self::Storage(err) => err.is_defect(),
            Self::Config { .. } => true,
            Self::Monitoring { .. } => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Monitoring {
            message: format!("serialization: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defect_classification_follows_the_source() {
        let transient: SyncError = CatalogError::feed("gateway timeout").into();
        assert!(!transient.is_defect());

        let defect: SyncError = SearchError::invariant("refcount mismatch").into();
        assert!(defect.is_defect());

        assert!(SyncError::config("missing gallery").is_defect());
        assert!(!SyncError::monitoring("queue unavailable").is_defect());
    }
}
