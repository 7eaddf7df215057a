//! Job and schedule subcommand handlers.
//!
//! Every command goes through the same store contract the servers use, so
//! it is safe to run against a live database.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use shiftwork_config::{Config, StorageBackend};
use shiftwork_daemon::{open_stores, settings, Stores};
use shiftwork_recurring::RecurringEvaluator;
use shiftwork_workqueue::clock::add_std;
use shiftwork_workqueue::{JobFilter, JobId, JobRecord, NewJob, SystemClock};

use crate::cli::{JobsAction, SchedulesAction};
use crate::handlers;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

async fn open(config: &Config) -> Result<Stores, Box<dyn std::error::Error>> {
    if config.storage.backend == StorageBackend::Memory {
        warn!("storage.backend is \"memory\"; this command only sees its own empty store");
    }
    Ok(open_stores(&config.storage, Arc::new(SystemClock)).await?)
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Enqueue a fire-and-forget job.
pub(crate) async fn enqueue(
    config: &Config,
    job_type: String,
    payload: &str,
    queue: String,
    delay_secs: Option<u64>,
    idempotency_key: Option<String>,
) -> CmdResult {
    let payload: Value = serde_json::from_str(payload)
        .map_err(|e| format!("payload is not valid JSON: {}", e))?;

    if !handlers::registry()?.contains(&job_type) {
        warn!(
            job.type = %job_type,
            "No handler for this job type in this binary; another server must provide it"
        );
    }

    let job = new_job(job_type, payload, queue, delay_secs, idempotency_key, Utc::now());
    let stores = open(config).await?;
    let id = stores.jobs.enqueue(job).await?;
    println!("{}", id);
    Ok(())
}

fn new_job(
    job_type: String,
    payload: Value,
    queue: String,
    delay_secs: Option<u64>,
    idempotency_key: Option<String>,
    now: DateTime<Utc>,
) -> NewJob {
    let mut job = NewJob::new(job_type, payload).with_queue(queue);
    if let Some(delay) = delay_secs {
        // Saturates instead of overflowing on absurd delays.
        job = job.with_visible_at(add_std(now, Duration::from_secs(delay)));
    }
    if let Some(key) = idempotency_key {
        job = job.with_idempotency_key(key);
    }
    job
}

/// Handle `jobs` subcommands.
pub(crate) async fn handle_jobs_command(action: JobsAction, config: &Config) -> CmdResult {
    let stores = open(config).await?;
    match action {
        JobsAction::List {
            state,
            queue,
            job_type,
            limit,
            format,
        } => {
            let filter = JobFilter {
                queue,
                state,
                job_type,
                limit: Some(limit),
            };
            let jobs = stores.jobs.list(&filter).await?;
            print_jobs(&jobs, &format)?;
            if format != "json" {
                let counts = stores.jobs.counts().await?;
                println!();
                println!(
                    "enqueued: {}  scheduled: {}  processing: {}  succeeded: {}  failed: {}",
                    counts.enqueued,
                    counts.scheduled,
                    counts.claimed + counts.processing,
                    counts.succeeded,
                    counts.failed
                );
            }
        }
        JobsAction::Show { id } => show_job(&stores, id).await?,
        JobsAction::Retry { id } => {
            stores.jobs.requeue(id).await?;
            println!("Requeued {}", id);
        }
        JobsAction::Delete { id } => {
            stores.jobs.delete(id).await?;
            println!("Deleted {}", id);
        }
    }
    Ok(())
}

fn print_jobs(jobs: &[JobRecord], format: &str) -> CmdResult {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<36} {:<10} {:<12} {:<24} {:>8}  {}",
        "ID", "STATE", "QUEUE", "TYPE", "ATTEMPTS", "CREATED"
    );
    println!("{}", "-".repeat(110));
    for job in jobs {
        println!(
            "{:<36} {:<10} {:<12} {:<24} {:>8}  {}",
            job.id,
            job.state,
            job.queue,
            job.job_type,
            job.attempt_count,
            format_time(Some(job.created_at))
        );
    }
    Ok(())
}

async fn show_job(stores: &Stores, id: JobId) -> CmdResult {
    let Some(job) = stores.jobs.get(id).await? else {
        return Err(format!("Job not found: {}", id).into());
    };

    println!("ID:          {}", job.id);
    println!("Type:        {}", job.job_type);
    println!("Queue:       {}", job.queue);
    println!("State:       {}", job.state);
    println!("Attempts:    {}", job.attempt_count);
    println!("Created:     {}", format_time(Some(job.created_at)));
    println!("Visible at:  {}", format_time(Some(job.visible_at)));
    println!("Changed:     {}", format_time(Some(job.last_state_change_at)));
    if let Some(lease) = &job.claimed_by {
        println!(
            "Lease:       {} until {}",
            lease.worker_id,
            format_time(Some(lease.expires_at))
        );
    }
    if let Some(key) = &job.idempotency_key {
        println!("Key:         {}", key);
    }
    println!("Payload:     {}", job.payload);
    if let Some(error) = &job.last_error {
        println!("Last error:  {}", error);
    }

    let console = stores.jobs.console(id).await?;
    if !console.is_empty() {
        println!();
        println!("Console:");
        for line in console {
            println!("  [{}] {}", format_time(Some(line.written_at)), line.line);
        }
    }
    Ok(())
}

/// Handle `schedules` subcommands.
pub(crate) async fn handle_schedules_command(action: SchedulesAction, config: &Config) -> CmdResult {
    let stores = open(config).await?;
    match action {
        SchedulesAction::List { format } => {
            let schedules = stores.schedules.list_schedules().await?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&schedules)?);
            } else if schedules.is_empty() {
                println!("No recurring schedules.");
            } else {
                println!(
                    "{:<20} {:<16} {:<16} {:<24} {:<12} {:<20} {}",
                    "ID", "CRON", "TIMEZONE", "TYPE", "QUEUE", "NEXT", "LAST"
                );
                println!("{}", "-".repeat(130));
                for s in schedules {
                    println!(
                        "{:<20} {:<16} {:<16} {:<24} {:<12} {:<20} {}",
                        s.id,
                        s.cron_expression,
                        s.timezone,
                        s.job_type,
                        s.queue,
                        format_time(s.next_fire_at),
                        format_time(s.last_fire_at)
                    );
                }
            }
        }
        SchedulesAction::Trigger { id } => {
            let evaluator = evaluator(config, stores)?;
            let job_id = evaluator.trigger_now(&id).await?;
            println!("{}", job_id);
        }
        SchedulesAction::Remove { id } => {
            let evaluator = evaluator(config, stores)?;
            evaluator.remove(&id).await?;
            println!("Removed {}", id);
        }
    }
    Ok(())
}

fn evaluator(
    config: &Config,
    stores: Stores,
) -> Result<RecurringEvaluator, Box<dyn std::error::Error>> {
    Ok(RecurringEvaluator::new(
        stores.jobs,
        stores.schedules,
        Arc::new(handlers::registry()?),
        Arc::new(SystemClock),
        settings::evaluator_config(config),
    ))
}
