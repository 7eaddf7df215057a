//! Shiftwork - persistent, distributed background job scheduler
//!
//! Main entry point for the Shiftwork server and admin CLI.

use std::path::Path;

use clap::Parser;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use shiftwork_config::{Config, ConfigError, ConfigLoader, LoggingConfig};

mod cli;
mod cmd_jobs;
mod cmd_server;
mod handlers;

use cli::{Cli, Commands};

/// Configuration used when no file is found.
const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    if path.is_some() {
        return ConfigLoader::load_or_default(path);
    }
    match ConfigLoader::default_paths().into_iter().find(|p| p.exists()) {
        Some(found) => ConfigLoader::load(&found),
        None => ConfigLoader::load_str(DEFAULT_CONFIG),
    }
}

/// Initialize tracing with console output and, when `logging.dir` is set,
/// a daily-rolling log file.
fn init_tracing(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let console = if logging.json {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().with_target(true).with_ansi(true).boxed()
    };

    let file = match &logging.dir {
        Some(dir) => {
            let log_dir = ConfigLoader::expand_path(dir);
            std::fs::create_dir_all(&log_dir)?;

            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("shiftwork")
                .filename_suffix("log")
                .max_log_files(30)
                .build(&log_dir)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Keeps the background writer alive for the program duration.
            static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
                std::sync::OnceLock::new();
            let _ = GUARD.set(guard);

            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging)?;
    if let Some(path) = &cli.config {
        info!("Using configuration {}", path.display());
    }

    match cli.command {
        None | Some(Commands::Run) => cmd_server::run_server(config).await,
        Some(Commands::Enqueue {
            job_type,
            payload,
            queue,
            delay_secs,
            idempotency_key,
        }) => {
            cmd_jobs::enqueue(&config, job_type, &payload, queue, delay_secs, idempotency_key).await
        }
        Some(Commands::Jobs { action }) => cmd_jobs::handle_jobs_command(action, &config).await,
        Some(Commands::Schedules { action }) => {
            cmd_jobs::handle_schedules_command(action, &config).await
        }
        Some(Commands::Health) => cmd_server::health(&config).await,
        Some(Commands::Config { action }) => {
            cmd_server::handle_config_command(action, &config).await
        }
    }
}
