//! Recurring job definitions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shiftwork_workqueue::{JobRegistry, DEFAULT_QUEUE};

use crate::error::RecurringError;
use crate::expression::CronSchedule;

/// A recurring job as registered by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    /// Stable schedule id; registering the same id again updates it.
    pub id: String,
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub job_type: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub payload: Value,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

impl RecurringJob {
    pub fn new(id: impl Into<String>, cron: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cron: cron.into(),
            timezone: default_timezone(),
            job_type: job_type.into(),
            queue: default_queue(),
            payload: Value::Null,
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Parse the cron expression in the configured timezone.
    pub fn schedule(&self) -> Result<CronSchedule, RecurringError> {
        Ok(CronSchedule::parse(&self.cron, &self.timezone)?)
    }

    /// Check the definition against the handlers known to this process.
    pub fn validate(&self, registry: &JobRegistry) -> Result<CronSchedule, RecurringError> {
        // The id is part of every idempotency key, which uses ':' as separator.
        if self.id.trim().is_empty() || self.id.contains(':') {
            return Err(RecurringError::InvalidId(self.id.clone()));
        }
        let schedule = self.schedule()?;
        if !registry.contains(&self.job_type) {
            return Err(RecurringError::UnknownJobType {
                id: self.id.clone(),
                job_type: self.job_type.clone(),
            });
        }
        Ok(schedule)
    }
}
