//! Error types for feedsync-catalog operations.

use thiserror::Error;

/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors that can occur during catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// Serialization/deserialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// CAS (Compare-And-Swap) operation failed due to concurrent modification.
    #[error("CAS failed: {message}")]
    CasFailed {
        /// Description of the CAS failure.
        message: String,
    },

    /// Resource not found.
    #[error("not found: {message}")]
    NotFound {
        /// Description of what was not found.
        message: String,
    },

    /// The source feed or deletion audit trail could not be read.
    #[error("feed error: {message}")]
    Feed {
        /// Description of the fetch failure.
        message: String,
    },

    /// A package id or version could not be parsed.
    #[error("invalid identity: {message}")]
    InvalidIdentity {
        /// Description of the invalid identity.
        message: String,
    },

    /// A commit item failed validation (for example, no declared types).
    #[error("invalid commit item: {message}")]
    InvalidCommitItem {
        /// Description of the validation failure.
        message: String,
    },

    /// A watermark component moved backwards.
    #[error("watermark regression: {message}")]
    WatermarkRegression {
        /// Description of the regressed component.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("invariant violated: {message}")]
    Invariant {
        /// Description of the violated invariant.
        message: String,
    },
}

impl CatalogError {
    /// Creates a feed error.
    #[must_use]
    pub fn feed(message: impl Into<String>) -> Self {
        Self::Feed {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns true if the error is a programming defect that must not be
    /// retried.
    #[must_use]
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            Self::InvalidCommitItem { .. }
                | Self::WatermarkRegression { .. }
                | Self::Invariant { .. }
        )
    }
}

impl From<feedsync_core::Error> for CatalogError {
    fn from(err: feedsync_core::Error) -> Self {
        use feedsync_core::Error as Core;
        match err {
            Core::NotFound(message) => Self::NotFound { message },
            Core::Serialization { message } => Self::Serialization { message },
            Core::InvalidIdentity { message } => Self::InvalidIdentity { message },
            Core::PreconditionFailed { message } => Self::CasFailed { message },
            Core::InvalidInput(message) | Core::Internal { message } => {
                Self::Invariant { message }
            }
            err @ Core::Storage { .. } => Self::Storage {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
