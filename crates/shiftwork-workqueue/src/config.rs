//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::job::DEFAULT_QUEUE;

/// How idle queue loops learn about new work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedJobsStrategy {
    /// Sleep `poll_interval` (plus jitter) between claim attempts.
    #[default]
    Poll,
    /// Also wake as soon as the store signals a change.
    Notify,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Prefix of the server id; shows up in every lease.
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Queues served by this process.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Maximum number of jobs executing at once across all queues.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Idle wait between claim attempts (in milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound of the random jitter added to each idle wait (in milliseconds).
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,

    /// Lease length granted on claim and on every heartbeat (in seconds).
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,

    /// Heartbeat period while a handler runs (in seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Period of the sweep / promote / purge loop (in seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Terminal jobs are purged once their last transition is older than this (in seconds).
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Idle wait strategy.
    #[serde(default)]
    pub check_queued_jobs: QueuedJobsStrategy,

    /// Time allowed for in-flight jobs to finish on shutdown (in seconds).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_server_name() -> String {
    "shiftwork".to_string()
}

fn default_queues() -> Vec<String> {
    vec![DEFAULT_QUEUE.to_string()]
}

fn default_worker_count() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_jitter() -> u64 {
    250
}

fn default_lease_duration() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_retention() -> u64 {
    86_400 // 1 day
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            queues: default_queues(),
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval(),
            jitter_ms: default_jitter(),
            lease_duration_secs: default_lease_duration(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            sweep_interval_secs: default_sweep_interval(),
            retention_secs: default_retention(),
            check_queued_jobs: QueuedJobsStrategy::default(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl SchedulerConfig {
    /// Get the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the jitter bound as a Duration.
    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    /// Get the lease duration as a Duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Get the heartbeat interval as a Duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Get the sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Get the retention window as a Duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Get the shutdown timeout as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.queues.is_empty() {
            return Err(QueueError::Config("at least one queue is required".to_string()));
        }
        if self.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(QueueError::Config("queue names must not be empty".to_string()));
        }
        if self.worker_count == 0 {
            return Err(QueueError::Config("worker_count must be greater than 0".to_string()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(QueueError::Config(
                "heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.lease_duration_secs <= self.heartbeat_interval_secs {
            return Err(QueueError::Config(format!(
                "lease_duration_secs ({}) must be greater than heartbeat_interval_secs ({})",
                self.lease_duration_secs, self.heartbeat_interval_secs
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(QueueError::Config(
                "sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queues, vec!["default".to_string()]);
        assert_eq!(config.check_queued_jobs, QueuedJobsStrategy::Poll);
        assert_eq!(config.lease_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_lease_must_exceed_heartbeat() {
        let config = SchedulerConfig {
            lease_duration_secs: 10,
            heartbeat_interval_secs: 10,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lease_duration_secs"));
    }

    #[test]
    fn test_empty_queues_rejected() {
        let config = SchedulerConfig {
            queues: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = SchedulerConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"queues": ["mail"], "check_queued_jobs": "notify"}"#).unwrap();
        assert_eq!(config.queues, vec!["mail".to_string()]);
        assert_eq!(config.check_queued_jobs, QueuedJobsStrategy::Notify);
        assert_eq!(config.worker_count, 4);
    }
}
