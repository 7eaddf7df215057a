//! Daemon-related errors.

use shiftwork_config::ConfigError;
use shiftwork_recurring::RecurringError;
use shiftwork_workqueue::{QueueError, StoreError};
use thiserror::Error;

/// Errors that can occur while building or running a server.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Recurring job error: {0}")]
    Recurring(#[from] RecurringError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to set up signal handlers.
    #[error("Failed to set up signal handlers: {0}")]
    SignalSetup(String),

    /// Health check failed.
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),
}
