//! Recurring schedule evaluator.
//!
//! Firing a schedule enqueues the job first and advances the schedule second.
//! The enqueue carries the idempotency key `"{schedule_id}:{fire_instant_ms}"`,
//! so a crash between the two steps, or two evaluators racing on the same
//! store, still yields one job per fire instant.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shiftwork_workqueue::{
    Clock, JobId, JobRegistry, JobStore, NewJob, RecurringSchedule, ScheduleStore, StoreBackoff,
};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::definition::RecurringJob;
use crate::error::RecurringError;
use crate::expression::CronSchedule;

/// How missed fire instants are handled after downtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    /// Enqueue a single job for all missed instants.
    #[default]
    FireOnce,
    /// Enqueue one job per missed instant, up to `max_catch_up`.
    All,
}

/// Evaluator settings.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub tick_interval: Duration,
    pub catch_up: CatchUpPolicy,
    pub max_catch_up: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            catch_up: CatchUpPolicy::FireOnce,
            max_catch_up: 100,
        }
    }
}

/// Outcome of one [`RecurringEvaluator::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Schedules found due.
    pub due: usize,
    /// Jobs enqueued (or found already enqueued) for this tick's firings.
    pub enqueued: Vec<JobId>,
    /// Schedules advanced by another evaluator first.
    pub lost_races: usize,
    /// Schedules whose stored expression could not be evaluated.
    pub invalid: usize,
    /// Schedules skipped because of a store error; retried next tick.
    pub failed: usize,
}

/// Fires due recurring schedules into the job store.
pub struct RecurringEvaluator {
    jobs: Arc<dyn JobStore>,
    schedules: Arc<dyn ScheduleStore>,
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    config: EvaluatorConfig,
    backoff: StoreBackoff,
}

impl RecurringEvaluator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        schedules: Arc<dyn ScheduleStore>,
        registry: Arc<JobRegistry>,
        clock: Arc<dyn Clock>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            jobs,
            schedules,
            registry,
            clock,
            config,
            backoff: StoreBackoff::default(),
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Register or update a recurring job.
    ///
    /// Re-registering an unchanged expression keeps the stored firing
    /// progress; changing the expression or timezone reschedules it.
    pub async fn register(&self, job: RecurringJob) -> Result<RecurringSchedule, RecurringError> {
        let cron = job.validate(&self.registry)?;
        let now = self.clock.now();
        let next_fire_at = cron.next_after(now);
        if next_fire_at.is_none() {
            warn!(schedule.id = %job.id, cron = %job.cron, "Cron expression has no future occurrence");
        }
        if let Some(period) = fires_faster_than(&cron, now, self.config.tick_interval) {
            warn!(
                schedule.id = %job.id,
                cron = %job.cron,
                period = ?period,
                tick_interval = ?self.config.tick_interval,
                catch_up = ?self.config.catch_up,
                "Schedule fires more often than the evaluator ticks; with fire_once some firings are skipped"
            );
        }

        let id = job.id.clone();
        self.schedules
            .upsert_schedule(RecurringSchedule {
                id: job.id,
                cron_expression: job.cron,
                timezone: job.timezone,
                job_type: job.job_type,
                queue: job.queue,
                payload: job.payload,
                next_fire_at,
                last_fire_at: None,
                created_at: now,
            })
            .await?;

        let stored = self
            .schedules
            .get_schedule(&id)
            .await?
            .ok_or_else(|| shiftwork_workqueue::StoreError::ScheduleNotFound(id.clone()))?;
        info!(
            schedule.id = %stored.id,
            cron = %stored.cron_expression,
            timezone = %stored.timezone,
            next_fire_at = ?stored.next_fire_at,
            "Registered recurring job"
        );
        Ok(stored)
    }

    /// Remove a recurring job. Jobs it already enqueued are left alone.
    pub async fn remove(&self, id: &str) -> Result<(), RecurringError> {
        self.schedules.remove_schedule(id).await?;
        info!(schedule.id = %id, "Removed recurring job");
        Ok(())
    }

    /// Enqueue a job for `id` immediately without touching its timing.
    pub async fn trigger_now(&self, id: &str) -> Result<JobId, RecurringError> {
        let schedule = self
            .schedules
            .get_schedule(id)
            .await?
            .ok_or_else(|| shiftwork_workqueue::StoreError::ScheduleNotFound(id.to_string()))?;
        let job = NewJob::new(schedule.job_type, schedule.payload).with_queue(schedule.queue);
        let job_id = self.jobs.enqueue(job).await?;
        info!(schedule.id = %id, job.id = %job_id, "Triggered recurring job manually");
        Ok(job_id)
    }

    /// Fire every schedule that is due now.
    pub async fn tick(&self) -> Result<TickReport, RecurringError> {
        let now = self.clock.now();
        let due = self.schedules.due_schedules(now).await?;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };

        for schedule in due {
            match self.fire(&schedule, now).await {
                Ok(Some(ids)) => report.enqueued.extend(ids),
                Ok(None) => report.lost_races += 1,
                Err(RecurringError::Cron(e)) => {
                    warn!(schedule.id = %schedule.id, error = %e, "Skipping schedule with invalid expression");
                    report.invalid += 1;
                }
                Err(e) => {
                    warn!(schedule.id = %schedule.id, error = %e, "Could not fire schedule, will retry next tick");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Fire one due schedule. `None` means another evaluator advanced it first.
    async fn fire(
        &self,
        schedule: &RecurringSchedule,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<JobId>>, RecurringError> {
        let Some(due_at) = schedule.next_fire_at else {
            return Ok(Some(Vec::new()));
        };
        let cron = CronSchedule::parse(&schedule.cron_expression, &schedule.timezone)?;

        let mut instants = vec![due_at];
        if self.config.catch_up == CatchUpPolicy::All {
            let limit = self.config.max_catch_up.saturating_sub(1);
            let mut missed = cron.occurrences_between(due_at, now, limit + 1);
            if missed.len() > limit {
                warn!(
                    schedule.id = %schedule.id,
                    max_catch_up = self.config.max_catch_up,
                    "Too many missed firings, skipping the rest"
                );
                missed.truncate(limit);
            }
            instants.extend(missed);
        }

        let mut ids = Vec::with_capacity(instants.len());
        for instant in &instants {
            let key = format!("{}:{}", schedule.id, instant.timestamp_millis());
            let job = NewJob::new(schedule.job_type.clone(), schedule.payload.clone())
                .with_queue(schedule.queue.clone())
                .with_idempotency_key(key);
            let id = self
                .backoff
                .retry_transient("enqueue recurring job", || self.jobs.enqueue(job.clone()))
                .await?;
            debug!(schedule.id = %schedule.id, job.id = %id, fire_at = %instant, "Fired recurring job");
            ids.push(id);
        }

        let last = instants.last().copied().unwrap_or(due_at);
        let next = cron.next_after(last.max(now));
        let advanced = self
            .backoff
            .retry_transient("advance recurring schedule", || {
                self.schedules.record_firing(&schedule.id, due_at, last, next)
            })
            .await?;
        if !advanced {
            debug!(schedule.id = %schedule.id, "Schedule already advanced by another evaluator");
            return Ok(None);
        }

        info!(
            schedule.id = %schedule.id,
            fired = ids.len(),
            next_fire_at = ?next,
            "Recurring schedule fired"
        );
        Ok(Some(ids))
    }

    /// Tick every `tick_interval` until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Recurring evaluator started (tick interval: {:?})",
            self.config.tick_interval
        );
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if !report.enqueued.is_empty() => {
                            debug!(due = report.due, enqueued = report.enqueued.len(), "Evaluator tick");
                        }
                        Ok(_) => {}
                        Err(e) if e.is_transient() => warn!(error = %e, "Evaluator tick failed, will retry"),
                        Err(e) => warn!(error = %e, "Evaluator tick failed"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Recurring evaluator stopped");
    }
}

/// Gap between the next two occurrences, when it is shorter than `tick`.
fn fires_faster_than(cron: &CronSchedule, now: DateTime<Utc>, tick: Duration) -> Option<Duration> {
    let first = cron.next_after(now)?;
    let second = cron.next_after(first)?;
    let period = (second - first).to_std().ok()?;
    (period < tick).then_some(period)
}

#[cfg(test)]
#[path = "evaluator_tests.rs"]
mod tests;
