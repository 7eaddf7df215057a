//! Per-queue claim loops and the maintenance loop.

use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use tokio::sync::futures::Notified;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{QueuedJobsStrategy, SchedulerConfig};
use crate::dispatcher::{Dispatcher, ExecutionOutcome};
use crate::error::{QueueError, StoreError};
use crate::job::JobRecord;
use crate::registry::JobRegistry;
use crate::retry::{RetryPolicy, StoreBackoff};
use crate::store::JobStore;

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// Counters shared by all loops of one scheduler.
#[derive(Debug)]
pub struct SchedulerStats {
    last_poll_at_ms: AtomicI64,
    in_flight: AtomicUsize,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
}

impl Default for SchedulerStats {
    fn default() -> Self {
        Self {
            last_poll_at_ms: AtomicI64::new(i64::MIN),
            in_flight: AtomicUsize::new(0),
            succeeded: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }
}

impl SchedulerStats {
    /// When a queue loop last asked the store for work.
    pub fn last_poll_at(&self) -> Option<DateTime<Utc>> {
        match self.last_poll_at_ms.load(Ordering::SeqCst) {
            i64::MIN => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn touch(&self, now: DateTime<Utc>) {
        self.last_poll_at_ms.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    fn record(&self, outcome: &ExecutionOutcome) {
        let counter = match outcome {
            ExecutionOutcome::Succeeded => &self.succeeded,
            ExecutionOutcome::Retrying { .. } => &self.retried,
            ExecutionOutcome::FailedTerminal { .. } => &self.failed,
            ExecutionOutcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Expired leases returned to `Enqueued`.
    pub swept: u64,
    /// Delayed jobs moved to `Enqueued`.
    pub promoted: u64,
    /// Terminal jobs removed after the retention window.
    pub purged: u64,
}

/// Drives claim loops for the configured queues.
pub struct Scheduler {
    config: SchedulerConfig,
    server_id: String,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    stats: Arc<SchedulerStats>,
    backoff: StoreBackoff,
}

impl Scheduler {
    /// Validate `config` and build a scheduler.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        if retry.max_attempts == 0 {
            return Err(QueueError::Config("max_attempts must be at least 1".to_string()));
        }

        let server_id = format!("{}:{}", config.server_name, Uuid::new_v4());
        info!(
            server.id = %server_id,
            queues = ?config.queues,
            workers = config.worker_count,
            lease_secs = config.lease_duration_secs,
            heartbeat_secs = config.heartbeat_interval_secs,
            "Scheduler configured"
        );
        if config.sweep_interval_secs > config.lease_duration_secs {
            warn!(
                "sweep_interval_secs ({}) exceeds lease_duration_secs ({}); crashed jobs wait up to {}s before recovery",
                config.sweep_interval_secs,
                config.lease_duration_secs,
                config.sweep_interval_secs + config.lease_duration_secs
            );
        }

        let dispatcher = Dispatcher::new(
            store.clone(),
            registry,
            retry,
            clock.clone(),
            config.lease_duration(),
            config.heartbeat_interval(),
        );

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.worker_count)),
            config,
            server_id,
            store,
            dispatcher: Arc::new(dispatcher),
            clock,
            stats: Arc::new(SchedulerStats::default()),
            backoff: StoreBackoff {
                max: MAX_ERROR_BACKOFF,
                ..Default::default()
            },
        })
    }

    /// `"{server_name}:{uuid}"`, unique per process.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Lease owner name used by the loop serving `queue`.
    pub fn worker_id(&self, queue: &str) -> String {
        format!("{}/{}", self.server_id, queue)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Claim and run at most one job from `queue` on the calling task.
    pub async fn run_once(&self, queue: &str) -> Result<Option<ExecutionOutcome>, StoreError> {
        let worker_id = self.worker_id(queue);
        self.stats.touch(self.clock.now());
        let Some(job) = self
            .store
            .claim(queue, &worker_id, self.config.lease_duration())
            .await?
        else {
            return Ok(None);
        };
        let outcome = self.dispatcher.execute(job).await?;
        self.stats.record(&outcome);
        Ok(Some(outcome))
    }

    /// One pass of lease sweep, delayed-job promotion and retention purge.
    pub async fn maintain(&self) -> Result<MaintenanceReport, StoreError> {
        let swept = self.store.sweep_expired_leases().await?;
        let promoted = self.store.promote_scheduled().await?;
        let cutoff = chrono::Duration::from_std(self.config.retention())
            .ok()
            .and_then(|retention| self.clock.now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.store.purge_terminal(cutoff).await?;
        Ok(MaintenanceReport {
            swept,
            promoted,
            purged,
        })
    }

    /// Spawn the queue loops and the maintenance loop.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> SchedulerHandle {
        let mut loops = Vec::new();
        for queue in &self.config.queues {
            let worker_id = self.worker_id(queue);
            info!(worker.id = %worker_id, "Starting queue loop");
            let span = info_span!("queue", queue = %queue, worker.id = %worker_id);
            let this = self.clone();
            let queue = queue.clone();
            let token = shutdown.clone();
            loops.push(tokio::spawn(
                async move { this.queue_loop(queue, worker_id, token).await }.instrument(span),
            ));
        }

        let this = self.clone();
        let token = shutdown.clone();
        loops.push(tokio::spawn(
            async move { this.maintenance_loop(token).await }.instrument(info_span!("maintenance")),
        ));

        SchedulerHandle {
            loops,
            permits: self.permits.clone(),
            worker_count: self.config.worker_count,
            shutdown,
        }
    }

    async fn queue_loop(self: Arc<Self>, queue: String, worker_id: String, shutdown: CancellationToken) {
        let notify = match self.config.check_queued_jobs {
            QueuedJobsStrategy::Notify => self.store.subscribe(),
            QueuedJobsStrategy::Poll => None,
        };
        let mut failures = 0;

        loop {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };
            if shutdown.is_cancelled() {
                break;
            }

            // Registered before the claim so an enqueue racing it still wakes us.
            let mut woken = notify.as_ref().map(|n| Box::pin(n.notified()));
            if let Some(woken) = woken.as_mut() {
                woken.as_mut().enable();
            }

            self.stats.touch(self.clock.now());
            match self
                .store
                .claim(&queue, &worker_id, self.config.lease_duration())
                .await
            {
                Ok(Some(job)) => {
                    failures = 0;
                    let this = self.clone();
                    tokio::spawn(async move { this.run_job(job, permit).await }.in_current_span());
                }
                Ok(None) => {
                    failures = 0;
                    drop(permit);
                    let wait = self.poll_delay();
                    trace!("No claimable job, waiting {:?}", wait);
                    idle_wait(wait, woken.as_mut(), &shutdown).await;
                }
                Err(e) => {
                    drop(permit);
                    failures += 1;
                    let delay = self.backoff.delay_for(failures);
                    if e.is_transient() {
                        warn!(error = %e, "Claim failed, retrying in {:?}", delay);
                    } else {
                        error!(error = %e, "Claim failed, retrying in {:?}", delay);
                    }
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
        info!("Queue loop stopped");
    }

    async fn run_job(self: Arc<Self>, job: JobRecord, permit: OwnedSemaphorePermit) {
        self.stats.in_flight.fetch_add(1, Ordering::SeqCst);
        match self.dispatcher.execute(job).await {
            Ok(outcome) => self.stats.record(&outcome),
            Err(e) => error!(error = %e, "Could not record job outcome; lease will expire"),
        }
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
    }

    async fn maintenance_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut failures = 0;
        loop {
            match self.maintain().await {
                Ok(report) => {
                    failures = 0;
                    if report != MaintenanceReport::default() {
                        info!(
                            swept = report.swept,
                            promoted = report.promoted,
                            purged = report.purged,
                            "Maintenance pass"
                        );
                    } else {
                        debug!("Maintenance pass, nothing to do");
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, attempt = failures, "Maintenance pass failed");
                }
            }

            let wait = if failures == 0 {
                self.config.sweep_interval()
            } else {
                self.backoff.delay_for(failures).min(self.config.sweep_interval())
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Maintenance loop stopped");
    }

    fn poll_delay(&self) -> Duration {
        let poll = self.config.poll_interval();
        if self.config.jitter_ms == 0 {
            return poll;
        }
        poll + Duration::from_millis(rand::thread_rng().gen_range(0..=self.config.jitter_ms))
    }

}

async fn idle_wait(wait: Duration, woken: Option<&mut Pin<Box<Notified<'_>>>>, shutdown: &CancellationToken) {
    match woken {
        Some(woken) => {
            tokio::select! {
                _ = sleep(wait) => {}
                _ = woken => trace!("Woken by store notification"),
                _ = shutdown.cancelled() => {}
            }
        }
        None => {
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.cancelled() => {}
            }
        }
    }
}

/// Handle to running scheduler loops.
#[derive(Debug)]
pub struct SchedulerHandle {
    loops: Vec<JoinHandle<()>>,
    permits: Arc<Semaphore>,
    worker_count: usize,
    shutdown: CancellationToken,
}

impl SchedulerHandle {
    /// Stop claiming new jobs.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the loops to stop, then up to `grace` for in-flight jobs.
    ///
    /// Returns false if jobs were still running when `grace` ran out; their
    /// leases expire and the jobs are recovered by another worker.
    pub async fn wait_for_shutdown(self, grace: Duration) -> bool {
        join_all(self.loops).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Scheduler loop panicked");
            }
        });

        let drained = timeout(grace, self.permits.acquire_many(self.worker_count as u32)).await;
        match drained {
            Ok(Ok(_permits)) => true,
            Ok(Err(_)) => true,
            Err(_) => {
                warn!("Shutdown grace period elapsed with jobs still running");
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
