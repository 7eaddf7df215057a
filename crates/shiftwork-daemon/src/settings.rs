//! Mapping from the configuration file onto runtime settings.

use std::time::Duration;

use shiftwork_config::{
    CatchUp, Config, MigrationMode, QueuedJobsCheck, RecurringConfig, StorageConfig,
};
use shiftwork_recurring::{CatchUpPolicy, EvaluatorConfig, RecurringJob};
use shiftwork_workqueue::{
    MigrationStrategy, QueuedJobsStrategy, RetryPolicy, SchedulerConfig, SqliteOptions,
};

pub fn scheduler_config(config: &Config) -> SchedulerConfig {
    SchedulerConfig {
        server_name: config.server.name.clone(),
        queues: config.queues.names.clone(),
        worker_count: config.queues.worker_count,
        poll_interval_ms: config.queues.poll_interval_ms,
        jitter_ms: config.queues.jitter_ms,
        lease_duration_secs: config.lease.duration_secs,
        heartbeat_interval_secs: config.lease.heartbeat_interval_secs,
        sweep_interval_secs: config.lease.sweep_interval_secs,
        retention_secs: config.retention.window_secs,
        check_queued_jobs: match config.storage.check_queued_jobs {
            QueuedJobsCheck::Poll => QueuedJobsStrategy::Poll,
            QueuedJobsCheck::Notify => QueuedJobsStrategy::Notify,
        },
        shutdown_timeout_secs: config.server.shutdown_timeout_secs,
    }
}

pub fn retry_policy(config: &Config) -> RetryPolicy {
    let retry = &config.retry;
    RetryPolicy {
        max_attempts: retry.max_attempts,
        base_delay: Duration::from_secs(retry.base_delay_secs),
        max_delay: Duration::from_secs(retry.max_delay_secs),
        multiplier: retry.multiplier,
        jitter: Duration::from_millis(retry.jitter_ms),
    }
}

pub fn evaluator_config(config: &Config) -> EvaluatorConfig {
    EvaluatorConfig {
        tick_interval: Duration::from_secs(config.evaluator.tick_interval_secs),
        catch_up: match config.evaluator.catch_up {
            CatchUp::FireOnce => CatchUpPolicy::FireOnce,
            CatchUp::All => CatchUpPolicy::All,
        },
        max_catch_up: config.evaluator.max_catch_up,
    }
}

/// SQLite options for `[storage]`; the path has `~` expanded.
pub fn sqlite_options(storage: &StorageConfig) -> SqliteOptions {
    SqliteOptions {
        check_connection: storage.check_connection,
        migration: match storage.migration {
            MigrationMode::Migrate => MigrationStrategy::Migrate,
            MigrationMode::Drop => MigrationStrategy::Drop,
            MigrationMode::None => MigrationStrategy::None,
        },
        backup_before_migrate: storage.backup_before_migrate,
        ..SqliteOptions::file(storage.resolved_path()).with_prefix(storage.prefix.clone())
    }
}

pub fn recurring_job(entry: &RecurringConfig) -> RecurringJob {
    RecurringJob::new(entry.id.clone(), entry.cron.clone(), entry.job_type.clone())
        .with_timezone(entry.timezone.clone())
        .with_queue(entry.queue.clone())
        .with_payload(entry.payload.clone())
}

pub fn recurring_jobs(config: &Config) -> Vec<RecurringJob> {
    config.recurring.iter().map(recurring_job).collect()
}

/// Longest acceptable gap between two claim attempts of a queue loop.
pub fn liveness_max_age(config: &SchedulerConfig) -> Duration {
    (config.poll_interval() + config.jitter()) * 3 + config.heartbeat_interval()
}
