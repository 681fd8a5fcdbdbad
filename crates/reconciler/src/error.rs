//! Error types for the reconciler crate.

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
///
/// Every variant except [`Error::InvalidConfig`] is a transient store
/// failure: the pass is aborted and the claim is retried with backoff.
#[derive(Debug, Error)]
pub enum Error {
    /// A store call failed.
    #[error("store operation '{operation}' failed: {reason}")]
    StoreFailed { operation: String, reason: String },

    /// Create of an object that already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// Write with a stale resource version.
    #[error("conflict on {kind} '{name}': resource version '{expected}' is stale")]
    Conflict {
        kind: String,
        name: String,
        expected: String,
    },

    /// Write to an object that does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// The latest image of a destination names a snapshot that does not exist.
    #[error("volume snapshot '{namespace}/{name}' not found")]
    SnapshotMissing { namespace: String, name: String },

    /// Object (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Kubernetes API call failed.
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a store failed error.
    pub fn store_failed(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreFailed {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
            expected: expected.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a snapshot missing error.
    pub fn snapshot_missing(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::SnapshotMissing {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the failed pass should be retried with backoff.
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidConfig { .. })
    }
}
