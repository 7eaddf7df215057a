//! Configuration validation.
//!
//! Checks that need runtime knowledge (cron syntax, timezones, registered job
//! types) are done by the server at startup.

use std::collections::HashSet;

use crate::error::ConfigError;
use crate::schema::{CatchUp, Config, StorageBackend};

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Turn collected errors into a single [`ConfigError`].
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        if self.errors.is_empty() {
            return Ok(self.warnings);
        }
        let message = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.path, e.message))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ConfigError::Invalid(message))
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_server(config, &mut result);
        Self::validate_storage(config, &mut result);
        Self::validate_queues(config, &mut result);
        Self::validate_lease(config, &mut result);
        Self::validate_retry(config, &mut result);
        Self::validate_evaluator(config, &mut result);
        Self::validate_dashboard(config, &mut result);
        Self::validate_recurring(config, &mut result);

        result
    }

    fn validate_server(config: &Config, result: &mut ValidationResult) {
        let name = &config.server.name;
        if name.trim().is_empty() {
            result.add_error(ValidationError::new("server.name", "Server name cannot be empty"));
        } else if name.contains('/') {
            result.add_error(ValidationError::new(
                "server.name",
                "Server name cannot contain '/', it separates server and queue in worker ids",
            ));
        }
        if config.server.health_check_interval_secs == 0 {
            result.add_error(ValidationError::new(
                "server.health_check_interval_secs",
                "health_check_interval_secs must be greater than 0",
            ));
        }
    }

    fn validate_storage(config: &Config, result: &mut ValidationResult) {
        let storage = &config.storage;
        let prefix_ok = !storage.prefix.is_empty()
            && storage
                .prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !storage.prefix.starts_with(|c: char| c.is_ascii_digit());
        if !prefix_ok {
            result.add_error(ValidationError::new(
                "storage.prefix",
                format!(
                    "Invalid prefix '{}': use letters, digits and '_', not starting with a digit",
                    storage.prefix
                ),
            ));
        }

        match storage.backend {
            StorageBackend::Sqlite if storage.path.trim().is_empty() => {
                result.add_error(ValidationError::new(
                    "storage.path",
                    "SQLite backend requires a database path",
                ));
            }
            StorageBackend::Memory => {
                result.add_warning(ValidationWarning::new(
                    "storage.backend",
                    "Memory backend is process-local; jobs are lost on exit and not shared between servers",
                ));
            }
            _ => {}
        }
    }

    fn validate_queues(config: &Config, result: &mut ValidationResult) {
        let queues = &config.queues;
        if queues.names.is_empty() {
            result.add_error(ValidationError::new("queues.names", "At least one queue is required"));
        }
        let mut seen = HashSet::new();
        for name in &queues.names {
            if name.trim().is_empty() {
                result.add_error(ValidationError::new("queues.names", "Queue names cannot be empty"));
            } else if !seen.insert(name.as_str()) {
                result.add_error(ValidationError::new(
                    "queues.names",
                    format!("Queue '{}' is listed twice", name),
                ));
            }
        }

        if queues.worker_count == 0 {
            result.add_error(ValidationError::new(
                "queues.worker_count",
                "worker_count must be greater than 0",
            ));
        } else if queues.worker_count < queues.names.len() {
            result.add_warning(ValidationWarning::new(
                "queues.worker_count",
                "Fewer workers than queues; some queues will wait for a free worker",
            ));
        }

        if queues.poll_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "queues.poll_interval_ms",
                "poll_interval_ms must be greater than 0",
            ));
        }
    }

    fn validate_lease(config: &Config, result: &mut ValidationResult) {
        let lease = &config.lease;
        if lease.heartbeat_interval_secs == 0 {
            result.add_error(ValidationError::new(
                "lease.heartbeat_interval_secs",
                "heartbeat_interval_secs must be greater than 0",
            ));
        }
        if lease.duration_secs <= lease.heartbeat_interval_secs {
            result.add_error(ValidationError::new(
                "lease.duration_secs",
                format!(
                    "Lease duration ({}s) must exceed the heartbeat interval ({}s)",
                    lease.duration_secs, lease.heartbeat_interval_secs
                ),
            ));
        }
        if lease.sweep_interval_secs == 0 {
            result.add_error(ValidationError::new(
                "lease.sweep_interval_secs",
                "sweep_interval_secs must be greater than 0",
            ));
        } else if lease.sweep_interval_secs > lease.duration_secs {
            result.add_warning(ValidationWarning::new(
                "lease.sweep_interval_secs",
                "Sweep interval exceeds lease duration; jobs of crashed workers wait longer to be recovered",
            ));
        }
    }

    fn validate_retry(config: &Config, result: &mut ValidationResult) {
        let retry = &config.retry;
        if retry.max_attempts == 0 {
            result.add_error(ValidationError::new(
                "retry.max_attempts",
                "max_attempts must be at least 1 (1 disables retries)",
            ));
        }
        if !(retry.multiplier >= 1.0) {
            result.add_error(ValidationError::new(
                "retry.multiplier",
                "multiplier must be at least 1.0",
            ));
        }
        if retry.base_delay_secs > retry.max_delay_secs {
            result.add_warning(ValidationWarning::new(
                "retry.base_delay_secs",
                "base_delay_secs exceeds max_delay_secs; every retry waits max_delay_secs",
            ));
        }
        if config.retention.window_secs == 0 {
            result.add_warning(ValidationWarning::new(
                "retention.window_secs",
                "Finished jobs are purged on the next maintenance pass",
            ));
        }
    }

    fn validate_evaluator(config: &Config, result: &mut ValidationResult) {
        let evaluator = &config.evaluator;
        if evaluator.tick_interval_secs == 0 {
            result.add_error(ValidationError::new(
                "evaluator.tick_interval_secs",
                "tick_interval_secs must be greater than 0",
            ));
        }
        if evaluator.catch_up == CatchUp::All && evaluator.max_catch_up == 0 {
            result.add_error(ValidationError::new(
                "evaluator.max_catch_up",
                "max_catch_up must be greater than 0 when catch_up = \"all\"",
            ));
        }
        if !evaluator.enabled && !config.recurring.is_empty() {
            result.add_warning(ValidationWarning::new(
                "evaluator.enabled",
                "Recurring jobs are registered but this server does not evaluate them",
            ));
        }
    }

    fn validate_dashboard(config: &Config, result: &mut ValidationResult) {
        let dashboard = &config.dashboard;
        if !dashboard.enabled {
            return;
        }
        let blank = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());
        if blank(&dashboard.user) {
            result.add_error(ValidationError::new(
                "dashboard.user",
                "Dashboard is enabled without a user",
            ));
        }
        if blank(&dashboard.password) {
            result.add_error(ValidationError::new(
                "dashboard.password",
                "Dashboard is enabled without a password",
            ));
        }
    }

    fn validate_recurring(config: &Config, result: &mut ValidationResult) {
        let mut ids = HashSet::new();
        for (i, entry) in config.recurring.iter().enumerate() {
            let path = format!("recurring[{}]", i);
            if entry.id.trim().is_empty() || entry.id.contains(':') {
                result.add_error(ValidationError::new(
                    format!("{}.id", path),
                    format!("Invalid recurring job id '{}'", entry.id),
                ));
            } else if !ids.insert(entry.id.as_str()) {
                result.add_error(ValidationError::new(
                    format!("{}.id", path),
                    format!("Recurring job id '{}' is defined twice", entry.id),
                ));
            }
            if entry.cron.trim().is_empty() {
                result.add_error(ValidationError::new(
                    format!("{}.cron", path),
                    "Cron expression cannot be empty",
                ));
            }
            if entry.job_type.trim().is_empty() {
                result.add_error(ValidationError::new(
                    format!("{}.job_type", path),
                    "job_type cannot be empty",
                ));
            }
            if !config.queues.names.contains(&entry.queue) {
                result.add_warning(ValidationWarning::new(
                    format!("{}.queue", path),
                    format!(
                        "Queue '{}' is not served by this server; another server must claim it",
                        entry.queue
                    ),
                ));
            }
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
