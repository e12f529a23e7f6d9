//! Error types for the cluster crate.

use thiserror::Error;

use crate::types::{ObjectKey, ResourceKind, ResourceVersion};

/// Result type alias for store and backend operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the resource store and job backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Object does not exist.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: ResourceKind, key: ObjectKey },

    /// Object with the same identity already exists.
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: ResourceKind, key: ObjectKey },

    /// Conditional write rejected because the stored version moved on.
    #[error("version conflict on '{key}': read version {expected}, stored version {actual}")]
    VersionConflict {
        key: ObjectKey,
        expected: ResourceVersion,
        actual: ResourceVersion,
    },

    /// Collaborator temporarily unreachable.
    #[error("'{operation}' unavailable: {reason}")]
    Unavailable { operation: String, reason: String },

    /// Object rejected by schema validation.
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },

    /// Watch subscription dropped events.
    #[error("watch subscription lagged, {skipped} events skipped")]
    Lagged { skipped: u64 },

    /// Change bus shut down.
    #[error("change bus closed")]
    ChannelClosed,
}

impl Error {
    /// Create a not found error.
    pub fn not_found(kind: ResourceKind, key: ObjectKey) -> Self {
        Self::NotFound { kind, key }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: ResourceKind, key: ObjectKey) -> Self {
        Self::AlreadyExists { kind, key }
    }

    /// Create an unavailable error.
    pub fn unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a validation error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the object was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether a create collided with an existing object.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether a conditional write lost a race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}
