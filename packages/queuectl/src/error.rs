//! Typed errors for the queue library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match
//! on the failure they care about.

use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// I/O failure outside the store (e.g. binding the dashboard listener)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input (empty command, malformed state name, ...)
    #[error("invalid job: {reason}")]
    Invalid { reason: String },

    /// Job not found in the main table
    #[error("job not found: {id}")]
    JobNotFound { id: String },

    /// Dead letter entry not found on manual retry
    #[error("dead letter entry not found: {id}")]
    DlqNotFound { id: String },
}

impl QueueError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        QueueError::Invalid {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
