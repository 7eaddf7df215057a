//! In-memory store.
//!
//! All state sits behind one mutex, so every operation is trivially atomic.
//! Suitable for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{add_std, Clock, SystemClock};
use crate::error::StoreError;
use crate::job::{
    ConsoleLine, FailureDisposition, JobFilter, JobId, JobRecord, JobState, Lease, LeaseStatus,
    LeaseToken, NewJob, StateCounts,
};
use crate::schedule::RecurringSchedule;
use crate::store::{JobStore, ScheduleStore};

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, JobRecord>,
    keys: HashMap<String, JobId>,
    console: HashMap<JobId, Vec<ConsoleLine>>,
    schedules: HashMap<String, RecurringSchedule>,
}

/// In-memory job and schedule store.
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    notify: Arc<Notify>,
}

impl MemoryJobStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            available: AtomicBool::new(true),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }

    /// Apply `f` to a job held under `token`, or report the lease lost.
    fn with_lease<F>(&self, id: JobId, token: LeaseToken, f: F) -> Result<LeaseStatus, StoreError>
    where
        F: FnOnce(&mut JobRecord, DateTime<Utc>),
    {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.is_held_under(token) => {
                f(job, now);
                Ok(LeaseStatus::Held)
            }
            _ => Ok(LeaseStatus::Lost),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn release(job: &mut JobRecord, state: JobState, now: DateTime<Utc>) {
    job.state = state;
    job.claimed_by = None;
    job.last_state_change_at = now;
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        self.check_available()?;
        let record = JobRecord::from_new(job, self.clock.now());
        let id = record.id;
        {
            let mut state = self.state.lock();
            if let Some(key) = &record.idempotency_key {
                if let Some(existing) = state.keys.get(key) {
                    debug!(job.id = %existing, key = %key, "Duplicate idempotency key, skipping enqueue");
                    return Ok(*existing);
                }
                state.keys.insert(key.clone(), id);
            }
            state.jobs.insert(id, record);
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();

        let next = state
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.is_claimable(now))
            .min_by_key(|job| (job.visible_at, job.created_at))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Claimed;
        job.claimed_by = Some(Lease {
            worker_id: worker_id.to_string(),
            token: Uuid::new_v4(),
            expires_at: add_std(now, lease_duration),
        });
        job.attempt_count += 1;
        job.last_state_change_at = now;
        Ok(Some(job.clone()))
    }

    async fn start_processing(&self, id: JobId, token: LeaseToken) -> Result<LeaseStatus, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Claimed && job.is_held_under(token) => {
                job.state = JobState::Processing;
                job.last_state_change_at = now;
                Ok(LeaseStatus::Held)
            }
            _ => Ok(LeaseStatus::Lost),
        }
    }

    async fn heartbeat(
        &self,
        id: JobId,
        token: LeaseToken,
        lease_duration: Duration,
    ) -> Result<LeaseStatus, StoreError> {
        self.with_lease(id, token, |job, now| {
            if let Some(lease) = job.claimed_by.as_mut() {
                lease.expires_at = add_std(now, lease_duration);
            }
        })
    }

    async fn complete(&self, id: JobId, token: LeaseToken) -> Result<LeaseStatus, StoreError> {
        self.with_lease(id, token, |job, now| {
            release(job, JobState::Succeeded, now);
        })
    }

    async fn fail(
        &self,
        id: JobId,
        token: LeaseToken,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<LeaseStatus, StoreError> {
        let status = self.with_lease(id, token, |job, now| {
            job.last_error = Some(error.to_string());
            match disposition {
                FailureDisposition::Retry { at } => {
                    release(job, JobState::Enqueued, now);
                    job.visible_at = at;
                }
                FailureDisposition::Terminal => release(job, JobState::Failed, now),
            }
        })?;
        if status == LeaseStatus::Held && matches!(disposition, FailureDisposition::Retry { .. }) {
            self.notify.notify_waiters();
        }
        Ok(status)
    }

    async fn sweep_expired_leases(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut swept = 0;
        {
            let mut state = self.state.lock();
            for job in state.jobs.values_mut() {
                if job.state.is_leased() && job.lease_expired(now) {
                    release(job, JobState::Enqueued, now);
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            self.notify.notify_waiters();
        }
        Ok(swept)
    }

    async fn promote_scheduled(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut promoted = 0;
        {
            let mut state = self.state.lock();
            for job in state.jobs.values_mut() {
                if job.state == JobState::Scheduled && job.visible_at <= now {
                    job.state = JobState::Enqueued;
                    job.last_state_change_at = now;
                    promoted += 1;
                }
            }
        }
        if promoted > 0 {
            self.notify.notify_waiters();
        }
        Ok(promoted)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn counts(&self) -> Result<StateCounts, StoreError> {
        self.check_available()?;
        let state = self.state.lock();
        let mut counts = StateCounts::default();
        for job in state.jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        if job.state.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.state,
                to: JobState::Deleted,
            });
        }
        release(job, JobState::Deleted, now);
        Ok(())
    }

    async fn requeue(&self, id: JobId) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            let job = state.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
            if !job.state.is_terminal() {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: job.state,
                    to: JobState::Enqueued,
                });
            }
            release(job, JobState::Enqueued, now);
            job.visible_at = now;
            job.attempt_count = 0;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.state.is_terminal() && job.last_state_change_at < before)
            .map(|job| job.id)
            .collect();
        for id in &expired {
            if let Some(job) = state.jobs.remove(id) {
                if let Some(key) = job.idempotency_key {
                    state.keys.remove(&key);
                }
            }
            state.console.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn append_console(&self, id: JobId, line: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.jobs.contains_key(&id) {
            return Err(StoreError::JobNotFound(id));
        }
        state.console.entry(id).or_default().push(ConsoleLine {
            written_at: now,
            line: line.to_string(),
        });
        Ok(())
    }

    async fn console(&self, id: JobId) -> Result<Vec<ConsoleLine>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().console.get(&id).cloned().unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    fn subscribe(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}

#[async_trait]
impl ScheduleStore for MemoryJobStore {
    async fn upsert_schedule(&self, schedule: RecurringSchedule) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        match state.schedules.get_mut(&schedule.id) {
            Some(existing) => {
                let timing_changed = existing.timing_changed(&schedule);
                existing.cron_expression = schedule.cron_expression;
                existing.timezone = schedule.timezone;
                existing.job_type = schedule.job_type;
                existing.queue = schedule.queue;
                existing.payload = schedule.payload;
                if timing_changed {
                    existing.next_fire_at = schedule.next_fire_at;
                }
            }
            None => {
                state.schedules.insert(schedule.id.clone(), schedule);
            }
        }
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<RecurringSchedule>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().schedules.get(id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, StoreError> {
        self.check_available()?;
        let mut schedules: Vec<RecurringSchedule> =
            self.state.lock().schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(schedules)
    }

    async fn remove_schedule(&self, id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.state
            .lock()
            .schedules
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::ScheduleNotFound(id.to_string()))
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<RecurringSchedule>, StoreError> {
        self.check_available()?;
        let mut due: Vec<RecurringSchedule> = self
            .state
            .lock()
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_fire_at.cmp(&b.next_fire_at));
        Ok(due)
    }

    async fn record_firing(
        &self,
        id: &str,
        expected_next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let schedule = state
            .schedules
            .get_mut(id)
            .ok_or_else(|| StoreError::ScheduleNotFound(id.to_string()))?;
        if schedule.next_fire_at != Some(expected_next) {
            return Ok(false);
        }
        schedule.last_fire_at = Some(fired_at);
        schedule.next_fire_at = next_fire_at;
        Ok(true)
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
