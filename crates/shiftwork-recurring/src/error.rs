//! Recurring schedule errors.

use shiftwork_workqueue::StoreError;
use thiserror::Error;

/// A cron expression or timezone that cannot be evaluated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Errors raised while registering or firing recurring schedules.
#[derive(Debug, Error)]
pub enum RecurringError {
    #[error(transparent)]
    Cron(#[from] CronError),

    /// The schedule names a job type with no registered handler.
    #[error("Schedule '{id}' uses unregistered job type '{job_type}'")]
    UnknownJobType { id: String, job_type: String },

    #[error("Invalid schedule id '{0}'")]
    InvalidId(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RecurringError {
    /// Whether the evaluator may succeed on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, RecurringError::Store(e) if e.is_transient())
    }
}
