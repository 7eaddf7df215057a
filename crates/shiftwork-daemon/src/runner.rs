//! Server assembly and lifecycle.
//!
//! [`ServerRunner`] turns a [`Config`] and a filled [`JobRegistry`] into a
//! [`Server`]: it validates the configuration, opens the store, registers
//! the configured recurring jobs and wires the health checks. [`Server::run`]
//! then drives the scheduler loops, the recurring evaluator and the health
//! loop until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use shiftwork_config::{Config, ConfigValidator, StorageBackend, StorageConfig};
use shiftwork_recurring::RecurringEvaluator;
use shiftwork_workqueue::{
    Clock, JobRegistry, JobStore, MemoryJobStore, ScheduleStore, Scheduler, SqliteJobStore,
    SystemClock,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::DaemonError;
use crate::health::{HealthChecker, StoreCheck, WorkerLivenessCheck};
use crate::settings;
use crate::signal::SignalHandler;

/// The job and schedule views of one backing store.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub schedules: Arc<dyn ScheduleStore>,
}

impl Stores {
    fn from_store<S>(store: Arc<S>) -> Self
    where
        S: JobStore + ScheduleStore + 'static,
    {
        Self {
            jobs: store.clone(),
            schedules: store,
        }
    }
}

/// Open the store described by `[storage]`.
///
/// For SQLite the parent directory of the database file is created first.
pub async fn open_stores(
    storage: &StorageConfig,
    clock: Arc<dyn Clock>,
) -> Result<Stores, DaemonError> {
    match storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory store");
            Ok(Stores::from_store(Arc::new(MemoryJobStore::with_clock(clock))))
        }
        StorageBackend::Sqlite => {
            let options = settings::sqlite_options(storage);
            if let Some(parent) = options.path.as_deref().and_then(|p| p.parent()) {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            info!(
                path = ?options.path,
                prefix = %options.prefix,
                "Opening SQLite store"
            );
            let store = SqliteJobStore::open_with_clock(options, clock).await?;
            Ok(Stores::from_store(Arc::new(store)))
        }
    }
}

/// Builder for a [`Server`].
pub struct ServerRunner {
    config: Config,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    stores: Option<Stores>,
}

impl ServerRunner {
    pub fn new(config: Config, registry: Arc<JobRegistry>) -> Self {
        Self {
            config,
            registry,
            clock: Arc::new(SystemClock),
            stores: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use already opened stores instead of `[storage]`.
    pub fn with_stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Validate, open the store and register recurring jobs.
    ///
    /// Any invalid setting, cron expression, timezone or unknown job type
    /// fails here, before a single job is claimed.
    pub async fn build(self) -> Result<Server, DaemonError> {
        let warnings = ConfigValidator::validate(&self.config).into_result()?;
        for warning in &warnings {
            warn!(path = %warning.path, "{}", warning.message);
        }

        let recurring = settings::recurring_jobs(&self.config);
        for job in &recurring {
            job.validate(&self.registry)?;
        }

        let stores = match self.stores {
            Some(stores) => stores,
            None => open_stores(&self.config.storage, self.clock.clone()).await?,
        };

        let scheduler_config = settings::scheduler_config(&self.config);
        let max_age = settings::liveness_max_age(&scheduler_config);
        let worker_count = scheduler_config.worker_count;
        let scheduler = Arc::new(Scheduler::new(
            scheduler_config,
            stores.jobs.clone(),
            self.registry.clone(),
            settings::retry_policy(&self.config),
            self.clock.clone(),
        )?);

        let evaluator = Arc::new(RecurringEvaluator::new(
            stores.jobs.clone(),
            stores.schedules.clone(),
            self.registry.clone(),
            self.clock.clone(),
            settings::evaluator_config(&self.config),
        ));
        for job in recurring {
            let id = job.id.clone();
            let schedule = evaluator.register(job).await?;
            info!(
                schedule.id = %id,
                cron = %schedule.cron_expression,
                timezone = %schedule.timezone,
                next_fire_at = ?schedule.next_fire_at,
                "Recurring job registered"
            );
        }

        let health = Arc::new(HealthChecker::new(Duration::from_secs(
            self.config.server.health_check_interval_secs,
        )));
        health.register(Arc::new(StoreCheck::new(stores.jobs.clone()))).await;
        health
            .register(Arc::new(WorkerLivenessCheck::new(
                scheduler.stats(),
                self.clock.clone(),
                max_age,
                worker_count,
            )))
            .await;

        Ok(Server {
            config: self.config,
            scheduler,
            evaluator,
            health,
            stores,
        })
    }
}

/// A fully assembled server, ready to run.
pub struct Server {
    config: Config,
    scheduler: Arc<Scheduler>,
    evaluator: Arc<RecurringEvaluator>,
    health: Arc<HealthChecker>,
    stores: Stores,
}

impl Server {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn evaluator(&self) -> &Arc<RecurringEvaluator> {
        &self.evaluator
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Run until `signals` requests shutdown.
    ///
    /// Returns true if every running job finished within the grace period.
    /// A terminate request stops waiting at once; abandoned jobs are
    /// recovered from their expired leases by the next server.
    pub async fn run(self, signals: SignalHandler) -> Result<bool, DaemonError> {
        let shutdown = signals.shutdown_token();
        let terminate = signals.terminate_token();

        let handle = self.scheduler.clone().start(shutdown.clone());

        let evaluator_task = if self.config.evaluator.enabled {
            Some(tokio::spawn(self.evaluator.clone().run(shutdown.clone())))
        } else {
            info!("Recurring evaluator disabled on this server");
            None
        };
        let health_task = tokio::spawn(self.health.clone().start_loop(shutdown.clone()));

        info!(
            server.id = %self.scheduler.server_id(),
            queues = ?self.config.queues.names,
            workers = self.config.queues.worker_count,
            "Server started"
        );

        shutdown.cancelled().await;

        let grace = Duration::from_secs(self.config.server.shutdown_timeout_secs);
        info!("Shutting down, waiting up to {:?} for running jobs", grace);

        let drained = tokio::select! {
            biased;
            _ = terminate.cancelled() => {
                warn!("Terminating without waiting for running jobs");
                false
            }
            drained = handle.wait_for_shutdown(grace) => drained,
        };

        join_task("evaluator", evaluator_task).await;
        join_task("health", Some(health_task)).await;

        info!(drained, "Server stopped");
        Ok(drained)
    }
}

async fn join_task(name: &str, task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Background task ended abnormally");
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
