//! Storage adapter contracts.
//!
//! Every state transition of a job goes through one of these methods, and
//! each method is a single atomic operation against the backing store.
//! Writes made on behalf of a worker are conditional on the claim's
//! [`LeaseToken`] still holding the lease; otherwise they report
//! [`LeaseStatus::Lost`] and change nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::error::StoreError;
use crate::job::{
    ConsoleLine, FailureDisposition, JobFilter, JobId, JobRecord, LeaseStatus, LeaseToken, NewJob,
    StateCounts,
};
use crate::schedule::RecurringSchedule;

/// Job persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job and return its id.
    ///
    /// If the job carries an idempotency key that is already present, the
    /// existing job's id is returned and nothing is written.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Atomically claim the oldest eligible job in `queue`.
    ///
    /// Eligible means `visible_at <= now` and either `Enqueued` or holding an
    /// expired lease. The claim sets `Claimed`, records a lease with a fresh
    /// token and bumps `attempt_count` in the same operation. `None` when
    /// nothing is eligible.
    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// `Claimed` → `Processing`.
    async fn start_processing(&self, id: JobId, token: LeaseToken) -> Result<LeaseStatus, StoreError>;

    /// Extend the lease to `now + lease_duration`.
    async fn heartbeat(
        &self,
        id: JobId,
        token: LeaseToken,
        lease_duration: Duration,
    ) -> Result<LeaseStatus, StoreError>;

    /// Record success and release the lease.
    async fn complete(&self, id: JobId, token: LeaseToken) -> Result<LeaseStatus, StoreError>;

    /// Record a failed attempt and release the lease.
    async fn fail(
        &self,
        id: JobId,
        token: LeaseToken,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<LeaseStatus, StoreError>;

    /// Return every job whose lease has expired to `Enqueued`.
    async fn sweep_expired_leases(&self) -> Result<u64, StoreError>;

    /// Move due `Scheduled` jobs to `Enqueued`.
    async fn promote_scheduled(&self) -> Result<u64, StoreError>;

    /// Fetch one job.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// List jobs, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError>;

    /// Number of jobs per state.
    async fn counts(&self) -> Result<StateCounts, StoreError>;

    /// Operator delete; allowed from any non-terminal state.
    async fn delete(&self, id: JobId) -> Result<(), StoreError>;

    /// Operator retry of a finished job; resets the attempt budget.
    async fn requeue(&self, id: JobId) -> Result<(), StoreError>;

    /// Remove terminal jobs whose last transition is older than `before`.
    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Append a console line to a job.
    async fn append_console(&self, id: JobId, line: &str) -> Result<(), StoreError>;

    /// Console lines of a job, oldest first.
    async fn console(&self, id: JobId) -> Result<Vec<ConsoleLine>, StoreError>;

    /// Reachability check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Change notification fired when claimable work may have appeared.
    ///
    /// Stores that cannot notify return `None` and callers fall back to polling.
    fn subscribe(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// Recurring schedule persistence.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or update a schedule.
    ///
    /// When an existing schedule keeps the same cron expression and timezone,
    /// its `next_fire_at` and `last_fire_at` are preserved.
    async fn upsert_schedule(&self, schedule: RecurringSchedule) -> Result<(), StoreError>;

    /// Fetch one schedule.
    async fn get_schedule(&self, id: &str) -> Result<Option<RecurringSchedule>, StoreError>;

    /// All schedules ordered by id.
    async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, StoreError>;

    /// Remove a schedule.
    async fn remove_schedule(&self, id: &str) -> Result<(), StoreError>;

    /// Schedules with `next_fire_at <= now`.
    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<RecurringSchedule>, StoreError>;

    /// Record a firing, conditional on `next_fire_at` still equal to `expected_next`.
    ///
    /// Returns false when another evaluator already advanced the schedule.
    async fn record_firing(
        &self,
        id: &str,
        expected_next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;
}
