//! Server, health and configuration subcommand handlers.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use shiftwork_config::{Config, ConfigValidator};
use shiftwork_daemon::{
    open_stores, settings, DaemonError, HealthChecker, HealthStatus, ServerRunner, SignalHandler,
    StoreCheck,
};
use shiftwork_workqueue::SystemClock;

use crate::cli::ConfigAction;
use crate::handlers;

type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Run a server in the foreground until SIGTERM/SIGINT.
pub(crate) async fn run_server(config: Config) -> CmdResult {
    info!("Starting Shiftwork v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(handlers::registry()?);
    info!(job_types = ?registry.job_types(), "Job handlers registered");

    let server = ServerRunner::new(config, registry).build().await?;

    let signals = SignalHandler::new();
    signals.setup_os_signals().await?;

    let drained = server.run(signals).await?;
    if !drained {
        info!("Unfinished jobs will be recovered once their leases expire");
    }
    Ok(())
}

/// One-off store check.
pub(crate) async fn health(config: &Config) -> CmdResult {
    let stores = open_stores(&config.storage, Arc::new(SystemClock)).await?;
    let checker = HealthChecker::new(Duration::from_secs(config.server.health_check_interval_secs));
    checker.register(Arc::new(StoreCheck::new(stores.jobs))).await;

    let result = checker.check().await;
    println!("Status: {}", result.status);
    for check in &result.checks {
        println!(
            "  {:<10} {:<10} {}",
            check.name,
            check.status,
            check.details.as_deref().unwrap_or("")
        );
    }

    if result.status == HealthStatus::Unhealthy {
        let message = result.message.unwrap_or_else(|| "unhealthy".to_string());
        return Err(DaemonError::HealthCheckFailed(message).into());
    }
    Ok(())
}

/// Handle `config` subcommands.
pub(crate) async fn handle_config_command(action: ConfigAction, config: &Config) -> CmdResult {
    match action {
        ConfigAction::Check => check_config(config),
        ConfigAction::Show => {
            let mut shown = config.clone();
            if shown.dashboard.password.is_some() {
                shown.dashboard.password = Some("********".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
            Ok(())
        }
    }
}

fn check_config(config: &Config) -> CmdResult {
    let result = ConfigValidator::validate(config);
    for warning in &result.warnings {
        println!("warning: {}: {}", warning.path, warning.message);
    }
    for error in &result.errors {
        println!("error: {}: {}", error.path, error.message);
    }

    let registry = handlers::registry()?;
    let mut invalid = result.errors.len();
    for job in settings::recurring_jobs(config) {
        match job.validate(&registry) {
            Ok(schedule) => {
                let next = schedule.next_after(chrono::Utc::now());
                println!(
                    "recurring {}: {} ({}), next {}",
                    job.id,
                    schedule.expression(),
                    schedule.timezone().name(),
                    next.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
                );
            }
            Err(e) => {
                println!("error: recurring {}: {}", job.id, e);
                invalid += 1;
            }
        }
    }

    if invalid > 0 {
        return Err(format!("{} configuration error(s)", invalid).into());
    }
    println!("Configuration OK");
    Ok(())
}
