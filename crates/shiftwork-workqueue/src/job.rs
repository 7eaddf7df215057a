//! Job records and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StoreError;

/// Queue used when none is given.
pub const DEFAULT_QUEUE: &str = "default";

/// Job identifier, assigned at enqueue time.
pub type JobId = Uuid;

/// Identifies one claim of a job. Every `claim` mints a fresh token, so a
/// worker that reclaims its own expired job holds a different lease.
pub type LeaseToken = Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker; claimable once `visible_at` has passed.
    Enqueued,
    /// Delayed; promoted to `Enqueued` once `visible_at` has passed.
    Scheduled,
    /// Held by a worker under a lease, not yet started.
    Claimed,
    /// Handler is running.
    Processing,
    /// Finished successfully.
    Succeeded,
    /// Failed with no further retries.
    Failed,
    /// Removed by an operator.
    Deleted,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 7] = [
        JobState::Scheduled,
        JobState::Enqueued,
        JobState::Claimed,
        JobState::Processing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Deleted,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Enqueued => "enqueued",
            JobState::Scheduled => "scheduled",
            JobState::Claimed => "claimed",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Deleted => "deleted",
        }
    }

    /// No automatic transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Deleted)
    }

    /// States in which a worker holds a lease.
    pub fn is_leased(&self) -> bool {
        matches!(self, JobState::Claimed | JobState::Processing)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(JobState::Enqueued),
            "scheduled" => Ok(JobState::Scheduled),
            "claimed" => Ok(JobState::Claimed),
            "processing" => Ok(JobState::Processing),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "deleted" => Ok(JobState::Deleted),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    /// Handler key.
    pub job_type: String,
    /// Handler arguments.
    pub payload: Value,
    /// Target queue.
    pub queue: String,
    /// Earliest claim time (None = immediately).
    pub visible_at: Option<DateTime<Utc>>,
    /// Deduplication key; a second enqueue with the same key is a no-op.
    pub idempotency_key: Option<String>,
}

impl NewJob {
    /// Create a job for the default queue.
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            visible_at: None,
            idempotency_key: None,
        }
    }

    /// Create a job from any serializable argument struct.
    pub fn from_args<T: Serialize>(job_type: impl Into<String>, args: &T) -> Result<Self, StoreError> {
        let payload = serde_json::to_value(args)?;
        Ok(Self::new(job_type, payload))
    }

    /// Set the queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Delay the job until `at`.
    pub fn with_visible_at(mut self, at: DateTime<Utc>) -> Self {
        self.visible_at = Some(at);
        self
    }

    /// Set the deduplication key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A worker's time-bounded exclusive hold on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker identity.
    pub worker_id: String,
    /// Token of this claim; lease-conditional writes must present it.
    pub token: LeaseToken,
    /// The lease may be reclaimed by anyone after this instant.
    pub expires_at: DateTime<Utc>,
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub queue: String,
    pub visible_at: DateTime<Utc>,
    pub claimed_by: Option<Lease>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_state_change_at: DateTime<Utc>,
}

impl JobRecord {
    /// Materialize a new job at `now`.
    pub fn from_new(job: NewJob, now: DateTime<Utc>) -> Self {
        let visible_at = job.visible_at.unwrap_or(now);
        let state = if visible_at > now {
            JobState::Scheduled
        } else {
            JobState::Enqueued
        };
        Self {
            id: Uuid::new_v4(),
            job_type: job.job_type,
            payload: job.payload,
            state,
            queue: job.queue,
            visible_at,
            claimed_by: None,
            attempt_count: 0,
            last_error: None,
            idempotency_key: job.idempotency_key,
            created_at: now,
            last_state_change_at: now,
        }
    }

    /// Whether the lease (if any) has run out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.claimed_by
            .as_ref()
            .is_some_and(|lease| lease.expires_at < now)
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.visible_at > now {
            return false;
        }
        match self.state {
            JobState::Enqueued => true,
            JobState::Claimed | JobState::Processing => self.lease_expired(now),
            _ => false,
        }
    }

    /// Token of the current claim, if any.
    pub fn lease_token(&self) -> Option<LeaseToken> {
        self.claimed_by.as_ref().map(|lease| lease.token)
    }

    /// Whether the claim identified by `token` currently holds the lease.
    pub fn is_held_under(&self, token: LeaseToken) -> bool {
        self.state.is_leased() && self.lease_token() == Some(token)
    }
}

/// Result of a lease-conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The caller still holds the lease and the write was applied.
    Held,
    /// The lease belongs to someone else (or nobody); nothing was written.
    Lost,
}

/// What to do with a job whose attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `Enqueued`, claimable again at `at`.
    Retry { at: DateTime<Utc> },
    /// `Failed`, never claimed again.
    Terminal,
}

/// Filter for read-only job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub state: Option<JobState>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Whether `job` passes the filter (limit excluded).
    pub fn matches(&self, job: &JobRecord) -> bool {
        self.queue.as_ref().is_none_or(|q| &job.queue == q)
            && self.state.is_none_or(|s| job.state == s)
            && self.job_type.as_ref().is_none_or(|t| &job.job_type == t)
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub enqueued: u64,
    pub scheduled: u64,
    pub claimed: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deleted: u64,
}

impl StateCounts {
    /// Add `n` jobs in `state`.
    pub fn add(&mut self, state: JobState, n: u64) {
        let slot = match state {
            JobState::Enqueued => &mut self.enqueued,
            JobState::Scheduled => &mut self.scheduled,
            JobState::Claimed => &mut self.claimed,
            JobState::Processing => &mut self.processing,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed => &mut self.failed,
            JobState::Deleted => &mut self.deleted,
        };
        *slot += n;
    }

    /// Count for one state.
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Enqueued => self.enqueued,
            JobState::Scheduled => self.scheduled,
            JobState::Claimed => self.claimed,
            JobState::Processing => self.processing,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
            JobState::Deleted => self.deleted,
        }
    }
}

/// One line of job console output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub written_at: DateTime<Utc>,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Deleted.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(!JobState::Scheduled.is_terminal());
    }

    #[test]
    fn test_delayed_job_starts_scheduled() {
        let job = NewJob::new("send_email", json!({})).with_visible_at(at(60));
        let record = JobRecord::from_new(job, at(0));
        assert_eq!(record.state, JobState::Scheduled);
        assert!(!record.is_claimable(at(0)));
    }

    #[test]
    fn test_immediate_job_is_claimable() {
        let record = JobRecord::from_new(NewJob::new("send_email", json!({})), at(0));
        assert_eq!(record.state, JobState::Enqueued);
        assert_eq!(record.queue, DEFAULT_QUEUE);
        assert!(record.is_claimable(at(0)));
    }

    #[test]
    fn test_expired_lease_is_claimable() {
        let mut record = JobRecord::from_new(NewJob::new("send_email", json!({})), at(0));
        record.state = JobState::Processing;
        let token = Uuid::new_v4();
        record.claimed_by = Some(Lease {
            worker_id: "w1".to_string(),
            token,
            expires_at: at(30),
        });
        assert!(!record.is_claimable(at(10)));
        assert!(record.is_held_under(token));
        assert!(!record.is_held_under(Uuid::new_v4()));
        assert!(record.is_claimable(at(31)));
    }

    #[test]
    fn test_filter_matches() {
        let record = JobRecord::from_new(
            NewJob::new("send_email", json!({})).with_queue("mail"),
            at(0),
        );
        assert!(JobFilter::default().matches(&record));
        assert!(JobFilter {
            queue: Some("mail".into()),
            state: Some(JobState::Enqueued),
            ..Default::default()
        }
        .matches(&record));
        assert!(!JobFilter {
            job_type: Some("resize".into()),
            ..Default::default()
        }
        .matches(&record));
    }

    #[test]
    fn test_state_counts() {
        let mut counts = StateCounts::default();
        counts.add(JobState::Failed, 2);
        counts.add(JobState::Failed, 1);
        assert_eq!(counts.get(JobState::Failed), 3);
        assert_eq!(counts.get(JobState::Enqueued), 0);
    }
}
