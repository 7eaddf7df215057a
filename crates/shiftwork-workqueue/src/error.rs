//! Workqueue errors.

use thiserror::Error;

use crate::job::{JobId, JobState};

/// Errors raised by a [`JobStore`](crate::store::JobStore) or
/// [`ScheduleStore`](crate::store::ScheduleStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached. Callers retry with backoff.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A payload could not be serialized or a stored row could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Recurring schedule not found.
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(String),

    /// The requested administrative transition is not allowed from the current state.
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition { id: JobId, from: JobState, to: JobState },

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Any other database error.
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether the operation may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Handler registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No handler is registered for the job type.
    #[error("No handler registered for job type '{0}'")]
    NotFound(String),

    /// A handler is already registered for the job type.
    #[error("Handler already registered for job type '{0}'")]
    Duplicate(String),
}

/// Error returned by a job handler.
#[derive(Debug, Error)]
pub enum JobError {
    /// The attempt failed; the job may be retried.
    #[error("{0}")]
    Failed(String),

    /// The job can never succeed; no retry.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// The payload does not match what the handler expects; no retry.
    #[error("Failed to deserialize payload: {0}")]
    Deserialization(String),

    /// The handler observed cancellation and stopped.
    #[error("Job cancelled")]
    Cancelled,
}

impl JobError {
    /// Retryable failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }

    /// Terminal failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent(message.into())
    }

    /// Whether retrying can never fix this error.
    pub fn is_permanent(&self) -> bool {
        matches!(self, JobError::Permanent(_) | JobError::Deserialization(_))
    }
}

/// Umbrella error for scheduler construction and control.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Storage error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Invalid scheduler configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}
