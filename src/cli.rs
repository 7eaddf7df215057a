//! CLI definitions for Shiftwork.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use shiftwork_workqueue::{JobId, JobState, DEFAULT_QUEUE};

/// Shiftwork CLI.
#[derive(Parser)]
#[command(name = "shiftwork")]
#[command(about = "Persistent, distributed background job scheduler")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (default: ./shiftwork.toml, then the user config dir)
    #[arg(short, long, global = true, env = "SHIFTWORK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run a server in the foreground (default)
    Run,

    /// Enqueue a fire-and-forget job
    Enqueue {
        /// Handler key, e.g. console.write_line
        job_type: String,

        /// JSON payload
        #[arg(default_value = "null")]
        payload: String,

        /// Target queue
        #[arg(short, long, default_value = DEFAULT_QUEUE)]
        queue: String,

        /// Delay before the job becomes claimable (in seconds)
        #[arg(long)]
        delay_secs: Option<u64>,

        /// Deduplication key; a second enqueue with the same key is a no-op
        #[arg(long)]
        idempotency_key: Option<String>,
    },

    /// Inspect and manage jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Inspect and manage recurring schedules
    Schedules {
        #[command(subcommand)]
        action: SchedulesAction,
    },

    /// Check store reachability and print job counts
    Health,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List jobs, newest first
    List {
        /// Filter by state (enqueued, scheduled, claimed, processing, succeeded, failed, deleted)
        #[arg(long)]
        state: Option<JobState>,

        /// Filter by queue
        #[arg(long)]
        queue: Option<String>,

        /// Filter by job type
        #[arg(long)]
        job_type: Option<String>,

        /// Maximum number of jobs shown
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Show one job with its console output
    Show {
        id: JobId,
    },

    /// Requeue a finished job with a fresh attempt budget
    Retry {
        id: JobId,
    },

    /// Delete a job that has not finished
    Delete {
        id: JobId,
    },
}

#[derive(Subcommand)]
pub(crate) enum SchedulesAction {
    /// List recurring schedules
    List {
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Enqueue a job from a schedule now, without moving its timing
    Trigger {
        id: String,
    },

    /// Remove a recurring schedule
    Remove {
        id: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Validate the configuration, including cron expressions and job types
    Check,

    /// Print the effective configuration as JSON (password redacted)
    Show,
}
