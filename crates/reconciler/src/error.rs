//! Error types for the reconciler crate.

use std::time::Duration;

use echo_cluster::ObjectKey;
use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The resource store failed.
    #[error("resource store error: {0}")]
    Store(#[source] echo_cluster::Error),

    /// The job backend failed.
    #[error("job backend error: {0}")]
    Backend(#[source] echo_cluster::Error),

    /// The job recorded for a running Echo has disappeared.
    #[error("job '{job}' of '{key}' is missing while the Echo is Running")]
    JobLost { key: ObjectKey, job: String },

    /// A collaborator call did not answer in time.
    #[error("'{operation}' timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The pass was aborted by shutdown.
    #[error("reconciliation cancelled")]
    Cancelled,

    /// The work queue no longer accepts work.
    #[error("work queue is shut down")]
    QueueShutdown,

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a job lost error.
    pub fn job_lost(key: ObjectKey, job: impl Into<String>) -> Self {
        Self::JobLost {
            key,
            job: job.into(),
        }
    }

    /// Create a timeout error.
    pub const fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the key should be retried with backoff.
    ///
    /// Configuration and shutdown errors will not get better by retrying.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Store(_)
            | Self::Backend(_)
            | Self::JobLost { .. }
            | Self::Timeout { .. }
            | Self::Cancelled => true,
            Self::QueueShutdown | Self::InvalidConfig { .. } => false,
        }
    }
}
