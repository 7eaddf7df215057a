//! Job execution configuration types (retry, evaluator, recurring jobs).

use serde::{Deserialize, Serialize};

use super::default_true;

/// Retry policy for failed jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total executions allowed, the first one included. 1 disables retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_retry_jitter")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_ms: default_retry_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    5
}

fn default_max_delay() -> u64 {
    3600
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_retry_jitter() -> u64 {
    1000
}

/// Missed-firing policy of the recurring evaluator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUp {
    #[default]
    FireOnce,
    All,
}

/// Recurring evaluator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    #[serde(default)]
    pub catch_up: CatchUp,

    /// Upper bound of jobs enqueued per schedule per tick with `catch_up = "all"`.
    #[serde(default = "default_max_catch_up")]
    pub max_catch_up: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            tick_interval_secs: default_tick_interval(),
            catch_up: CatchUp::default(),
            max_catch_up: default_max_catch_up(),
        }
    }
}

fn default_tick_interval() -> u64 {
    15
}

fn default_max_catch_up() -> usize {
    100
}

/// A `[[recurring]]` job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringConfig {
    pub id: String,

    /// 5-field, 6-field (with seconds) or `@macro` cron expression.
    pub cron: String,

    pub job_type: String,

    #[serde(default = "default_recurring_queue")]
    pub queue: String,

    /// IANA timezone the expression is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_recurring_queue() -> String {
    "default".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}
