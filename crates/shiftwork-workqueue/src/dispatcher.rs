//! Runs claimed jobs and records their outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::clock::Clock;
use crate::error::{JobError, StoreError};
use crate::job::{FailureDisposition, JobId, JobRecord, LeaseStatus, LeaseToken};
use crate::registry::{JobContext, JobRegistry};
use crate::retry::{RetryPolicy, StoreBackoff};
use crate::store::JobStore;

/// Result of executing one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler succeeded and the job is `Succeeded`.
    Succeeded,
    /// Attempt failed; the job is claimable again at `at`.
    Retrying { at: DateTime<Utc> },
    /// The job is `Failed` for good.
    FailedTerminal { error: String },
    /// The lease was lost; nothing was recorded for this attempt.
    Abandoned,
}

/// Executes claimed jobs through the registry.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
    heartbeat_interval: Duration,
    backoff: StoreBackoff,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        lease_duration: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            retry,
            clock,
            lease_duration,
            heartbeat_interval,
            backoff: StoreBackoff::default(),
        }
    }

    /// Override the backoff used for outcome writes.
    pub fn with_store_backoff(mut self, backoff: StoreBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run one attempt of a job as returned by `claim`.
    ///
    /// Every write goes through the lease token of that claim. Errors are
    /// store errors that outlived the write backoff; the lease then expires
    /// and the job is picked up again after the sweep.
    pub async fn execute(&self, job: JobRecord) -> Result<ExecutionOutcome, StoreError> {
        let Some(lease) = job.claimed_by.clone() else {
            warn!(job.id = %job.id, "Job carries no lease, not running it");
            return Ok(ExecutionOutcome::Abandoned);
        };
        let span = info_span!(
            "job",
            job.id = %job.id,
            job.type = %job.job_type,
            queue = %job.queue,
            worker.id = %lease.worker_id,
            attempt = job.attempt_count,
        );
        self.execute_inner(job, lease.token).instrument(span).await
    }

    async fn execute_inner(
        &self,
        job: JobRecord,
        token: LeaseToken,
    ) -> Result<ExecutionOutcome, StoreError> {
        let handler = match self.registry.resolve(&job.job_type) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(error = %e, "No handler for job");
                return self.record_failure(&job, token, &JobError::permanent(e.to_string())).await;
            }
        };

        // Leases that expired mid-run are reclaimed without going through
        // `fail`, so the retry bound is enforced here as well.
        if job.attempt_count > self.retry.max_attempts {
            let error = JobError::permanent(format!(
                "attempt {} exceeds max_attempts {}",
                job.attempt_count, self.retry.max_attempts
            ));
            return self.record_failure(&job, token, &error).await;
        }

        match self.store.start_processing(job.id, token).await? {
            LeaseStatus::Held => {}
            LeaseStatus::Lost => {
                info!("Lease lost before processing started");
                return Ok(ExecutionOutcome::Abandoned);
            }
        }

        let cancel = CancellationToken::new();
        let ctx = JobContext::new(&job, cancel.clone(), self.store.clone());
        let heartbeat = self.spawn_heartbeat(job.id, token, cancel.clone());

        debug!("Running handler");
        let run = AssertUnwindSafe(handler.handle(&ctx)).catch_unwind();
        let result = tokio::select! {
            result = run => Some(result.unwrap_or_else(|panic| {
                Err(JobError::Failed(format!("handler panicked: {}", panic_message(&*panic))))
            })),
            _ = cancel.cancelled() => None,
        };
        heartbeat.abort();

        match result {
            None => {
                info!("Lease lost while running, abandoning attempt");
                Ok(ExecutionOutcome::Abandoned)
            }
            Some(Ok(())) => self.record_success(&job, token).await,
            Some(Err(e)) => self.record_failure(&job, token, &e).await,
        }
    }

    async fn record_success(
        &self,
        job: &JobRecord,
        token: LeaseToken,
    ) -> Result<ExecutionOutcome, StoreError> {
        let status = self
            .backoff
            .retry_transient("complete", || self.store.complete(job.id, token))
            .await?;
        match status {
            LeaseStatus::Held => {
                info!("Job succeeded");
                Ok(ExecutionOutcome::Succeeded)
            }
            LeaseStatus::Lost => {
                info!("Lease lost before success was recorded");
                Ok(ExecutionOutcome::Abandoned)
            }
        }
    }

    async fn record_failure(
        &self,
        job: &JobRecord,
        token: LeaseToken,
        error: &JobError,
    ) -> Result<ExecutionOutcome, StoreError> {
        let disposition = self.retry.decide(job.attempt_count, error, self.clock.now());
        let message = error.to_string();
        let status = self
            .backoff
            .retry_transient("fail", || {
                self.store.fail(job.id, token, &message, disposition)
            })
            .await?;

        if status == LeaseStatus::Lost {
            info!("Lease lost before failure was recorded");
            return Ok(ExecutionOutcome::Abandoned);
        }
        match disposition {
            FailureDisposition::Retry { at } => {
                warn!(error = %message, retry_at = %at, "Job failed, will retry");
                Ok(ExecutionOutcome::Retrying { at })
            }
            FailureDisposition::Terminal => {
                warn!(error = %message, "Job failed permanently");
                Ok(ExecutionOutcome::FailedTerminal { error: message })
            }
        }
    }

    fn spawn_heartbeat(&self, id: JobId, token: LeaseToken, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let lease = self.lease_duration;
        let interval = self.heartbeat_interval;
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = cancel.cancelled() => return,
                    }
                    match store.heartbeat(id, token, lease).await {
                        Ok(LeaseStatus::Held) => debug!("Lease extended"),
                        Ok(LeaseStatus::Lost) => {
                            warn!("Heartbeat found the lease taken, cancelling handler");
                            cancel.cancel();
                            return;
                        }
                        Err(e) => warn!(error = %e, "Heartbeat failed"),
                    }
                }
            }
            .in_current_span(),
        )
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
