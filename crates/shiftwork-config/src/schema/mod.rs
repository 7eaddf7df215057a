//! Configuration schema definitions.

use serde::{Deserialize, Serialize};

mod schema_jobs;
mod schema_storage;

pub use schema_jobs::*;
pub use schema_storage::*;

/// Shared default helper used by submodules.
pub(crate) fn default_true() -> bool {
    true
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queues: QueuesConfig,

    #[serde(default)]
    pub lease: LeaseConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    #[serde(default)]
    pub dashboard: DashboardConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub recurring: Vec<RecurringConfig>,
}

/// Server identity and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Prefix of the server id and of every worker id.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Grace period for in-flight jobs on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Period of the health check loop (in seconds).
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            health_check_interval_secs: default_health_check_interval(),
        }
    }
}

fn default_server_name() -> String {
    "shiftwork".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    30
}

/// Queue loops and worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// Queues this server claims from.
    #[serde(default = "default_queue_names")]
    pub names: Vec<String>,

    /// Maximum number of jobs executing at once.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Upper bound of the random delay added to each idle wait.
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            names: default_queue_names(),
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval(),
            jitter_ms: default_jitter(),
        }
    }
}

fn default_queue_names() -> Vec<String> {
    vec!["default".to_string()]
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

/// Worker leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_duration")]
    pub duration_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// How often expired leases are swept and delayed jobs promoted.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_lease_duration(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
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

/// Terminal job retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_window")]
    pub window_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window_secs: default_retention_window(),
        }
    }
}

fn default_retention_window() -> u64 {
    86_400
}

/// Dashboard credentials. The dashboard itself is served elsewhere.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl std::fmt::Debug for DashboardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DashboardConfig")
            .field("enabled", &self.enabled)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily log files; console only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
