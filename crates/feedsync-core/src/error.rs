//! Error types and result aliases for feedsync.
//!
//! This module defines the error type shared by the storage layer and the
//! identity primitives. Domain crates wrap it in their own error enums.

/// The result type used throughout feedsync-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid package identifier or version was provided.
    #[error("invalid identity: {message}")]
    InvalidIdentity {
        /// Description of what made the identity invalid.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new invalid identity error.
    #[must_use]
    pub fn invalid_identity(message: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            message: message.into(),
        }
    }

    /// Returns true if the error is a programming defect rather than a
    /// transient condition that a later retry could clear.
    #[must_use]
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            Self::InvalidIdentity { .. } | Self::InvalidInput(_) | Self::Internal { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_keeps_source() {
        let io = std::io::Error::other("disk gone");
        let err = Error::storage_with_source("write failed", io);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "storage error: write failed");
    }

    #[test]
    fn defect_classification() {
        assert!(Error::invalid_identity("empty id").is_defect());
        assert!(!Error::storage("timeout").is_defect());
        assert!(!Error::NotFound("index.json".into()).is_defect());
    }
}
