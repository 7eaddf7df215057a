use super::*;
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;

use chrono::TimeZone;
use parking_lot::Mutex;
use serde_json::json;

use crate::clock::{ManualClock, SystemClock};
use crate::error::JobError;
use crate::job::{
    ConsoleLine, FailureDisposition, JobFilter, JobId, JobState, LeaseStatus, LeaseToken, NewJob,
    StateCounts,
};
use crate::memory::MemoryJobStore;
use crate::registry::{handler_fn, JobContext};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        server_name: "test".to_string(),
        poll_interval_ms: 10,
        jitter_ms: 5,
        lease_duration_secs: 30,
        heartbeat_interval_secs: 10,
        sweep_interval_secs: 1,
        ..Default::default()
    }
}

fn no_jitter_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_secs(10),
        max_delay: Duration::from_secs(300),
        multiplier: 2.0,
        jitter: Duration::ZERO,
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(10), async {
        while !check().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[test]
fn test_new_rejects_invalid_config() {
    let config = SchedulerConfig {
        lease_duration_secs: 5,
        heartbeat_interval_secs: 10,
        ..Default::default()
    };
    let result = Scheduler::new(
        config,
        Arc::new(MemoryJobStore::new()),
        Arc::new(JobRegistry::new()),
        RetryPolicy::default(),
        Arc::new(SystemClock),
    );
    assert!(matches!(result, Err(QueueError::Config(_))));
}

#[test]
fn test_new_rejects_zero_attempts() {
    let result = Scheduler::new(
        SchedulerConfig::default(),
        Arc::new(MemoryJobStore::new()),
        Arc::new(JobRegistry::new()),
        RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        },
        Arc::new(SystemClock),
    );
    assert!(result.is_err());
}

#[test]
fn test_worker_id_format() {
    let scheduler = Scheduler::new(
        fast_config(),
        Arc::new(MemoryJobStore::new()),
        Arc::new(JobRegistry::new()),
        RetryPolicy::default(),
        Arc::new(SystemClock),
    )
    .unwrap();
    assert!(scheduler.server_id().starts_with("test:"));
    let worker_id = scheduler.worker_id("mail");
    assert!(worker_id.starts_with(scheduler.server_id()));
    assert!(worker_id.ends_with("/mail"));
}

#[tokio::test]
async fn test_run_once_send_email_scenario() {
    let clock = ManualClock::new(start());
    let store = Arc::new(MemoryJobStore::with_clock(Arc::new(clock.clone())));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let registry = JobRegistry::new()
        .with_handler(
            "send_email",
            handler_fn(move |_ctx| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(JobError::retryable("smtp timeout"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .unwrap();
    let scheduler = Scheduler::new(
        fast_config(),
        store.clone(),
        Arc::new(registry),
        no_jitter_policy(3),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let id = store
        .enqueue(NewJob::new("send_email", json!({"to": "user@example.com"})))
        .await
        .unwrap();

    for _ in 0..2 {
        let Some(ExecutionOutcome::Retrying { at }) = scheduler.run_once("default").await.unwrap()
        else {
            panic!("expected a retry");
        };
        assert_eq!(scheduler.run_once("default").await.unwrap(), None);
        clock.set(at);
    }
    assert_eq!(
        scheduler.run_once("default").await.unwrap(),
        Some(ExecutionOutcome::Succeeded)
    );

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempt_count, 3);
    let stats = scheduler.stats();
    assert_eq!(stats.retried(), 2);
    assert_eq!(stats.succeeded(), 1);
    assert_eq!(stats.last_poll_at(), Some(clock.now()));
}

#[tokio::test]
async fn test_maintain_sweeps_promotes_and_purges() {
    let clock = ManualClock::new(start());
    let store = Arc::new(MemoryJobStore::with_clock(Arc::new(clock.clone())));
    let config = SchedulerConfig {
        retention_secs: 600,
        ..fast_config()
    };
    let scheduler = Scheduler::new(
        config,
        store.clone(),
        Arc::new(JobRegistry::new()),
        RetryPolicy::default(),
        Arc::new(clock.clone()),
    )
    .unwrap();

    let crashed = store.enqueue(NewJob::new("a", json!({}))).await.unwrap();
    store.claim("default", "gone", Duration::from_secs(30)).await.unwrap();
    let delayed = store
        .enqueue(NewJob::new("a", json!({})).with_visible_at(start() + chrono::Duration::seconds(60)))
        .await
        .unwrap();
    let finished = store.enqueue(NewJob::new("a", json!({})).with_queue("other")).await.unwrap();
    store.delete(finished).await.unwrap();

    clock.advance(Duration::from_secs(61));
    let report = scheduler.maintain().await.unwrap();
    assert_eq!(
        report,
        MaintenanceReport {
            swept: 1,
            promoted: 1,
            purged: 0
        }
    );
    assert_eq!(store.get(crashed).await.unwrap().unwrap().state, JobState::Enqueued);
    assert_eq!(store.get(delayed).await.unwrap().unwrap().state, JobState::Enqueued);

    clock.advance(Duration::from_secs(600));
    let report = scheduler.maintain().await.unwrap();
    assert_eq!(report.purged, 1);
    assert!(store.get(finished).await.unwrap().is_none());
}

#[tokio::test]
async fn test_loops_process_enqueued_jobs() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = JobRegistry::new()
        .with_handler(
            "console.write_line",
            handler_fn(|ctx: JobContext| async move {
                let line: String = ctx.payload()?;
                ctx.write_line(&line).await;
                Ok(())
            }),
        )
        .unwrap();
    let config = SchedulerConfig {
        queues: vec!["default".to_string(), "mail".to_string()],
        ..fast_config()
    };
    let scheduler = Arc::new(
        Scheduler::new(
            config,
            store.clone(),
            Arc::new(registry),
            RetryPolicy::default(),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );
    for i in 0..5 {
        store
            .enqueue(NewJob::new("console.write_line", json!(format!("line {i}"))))
            .await
            .unwrap();
        store
            .enqueue(NewJob::new("console.write_line", json!("mail")).with_queue("mail"))
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let handle = scheduler.clone().start(shutdown.clone());
    wait_until(|| {
        let store = store.clone();
        async move { store.counts().await.unwrap().succeeded == 10 }
    })
    .await;

    shutdown.cancel();
    assert!(handle.wait_for_shutdown(Duration::from_secs(5)).await);
    assert_eq!(scheduler.stats().succeeded(), 10);
    assert_eq!(scheduler.stats().in_flight(), 0);
}

#[tokio::test]
async fn test_notify_strategy_wakes_idle_loop() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = JobRegistry::new()
        .with_handler("noop", handler_fn(|_ctx| async { Ok(()) }))
        .unwrap();
    let config = SchedulerConfig {
        poll_interval_ms: 60_000,
        jitter_ms: 0,
        check_queued_jobs: QueuedJobsStrategy::Notify,
        ..fast_config()
    };
    let scheduler = Arc::new(
        Scheduler::new(
            config,
            store.clone(),
            Arc::new(registry),
            RetryPolicy::default(),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );
    let shutdown = CancellationToken::new();
    let handle = scheduler.clone().start(shutdown.clone());

    // Let the loop find the queue empty and park.
    sleep(Duration::from_millis(50)).await;
    let id = store.enqueue(NewJob::new("noop", json!({}))).await.unwrap();

    wait_until(|| {
        let store = store.clone();
        async move { store.get(id).await.unwrap().unwrap().state == JobState::Succeeded }
    })
    .await;

    shutdown.cancel();
    assert!(handle.wait_for_shutdown(Duration::from_secs(5)).await);
}

/// Enqueues one job from inside the first empty `claim`, so the store's
/// notification fires before the loop starts waiting.
struct EnqueueDuringClaim {
    inner: Arc<MemoryJobStore>,
    pending: Mutex<Option<NewJob>>,
}

#[async_trait::async_trait]
impl JobStore for EnqueueDuringClaim {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        self.inner.enqueue(job).await
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let claimed = self.inner.claim(queue, worker_id, lease_duration).await?;
        if claimed.is_none() {
            let pending = self.pending.lock().take();
            if let Some(job) = pending {
                self.inner.enqueue(job).await?;
            }
        }
        Ok(claimed)
    }

    async fn start_processing(&self, id: JobId, token: LeaseToken) -> Result<LeaseStatus, StoreError> {
        self.inner.start_processing(id, token).await
    }

    async fn heartbeat(
        &self,
        id: JobId,
        token: LeaseToken,
        lease_duration: Duration,
    ) -> Result<LeaseStatus, StoreError> {
        self.inner.heartbeat(id, token, lease_duration).await
    }

    async fn complete(&self, id: JobId, token: LeaseToken) -> Result<LeaseStatus, StoreError> {
        self.inner.complete(id, token).await
    }

    async fn fail(
        &self,
        id: JobId,
        token: LeaseToken,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<LeaseStatus, StoreError> {
        self.inner.fail(id, token, error, disposition).await
    }

    async fn sweep_expired_leases(&self) -> Result<u64, StoreError> {
        self.inner.sweep_expired_leases().await
    }

    async fn promote_scheduled(&self) -> Result<u64, StoreError> {
        self.inner.promote_scheduled().await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.list(filter).await
    }

    async fn counts(&self) -> Result<StateCounts, StoreError> {
        self.inner.counts().await
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn requeue(&self, id: JobId) -> Result<(), StoreError> {
        self.inner.requeue(id).await
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.purge_terminal(before).await
    }

    async fn append_console(&self, id: JobId, line: &str) -> Result<(), StoreError> {
        self.inner.append_console(id, line).await
    }

    async fn console(&self, id: JobId) -> Result<Vec<ConsoleLine>, StoreError> {
        self.inner.console(id).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    fn subscribe(&self) -> Option<Arc<tokio::sync::Notify>> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn test_notify_during_empty_claim_is_not_lost() {
    let inner = Arc::new(MemoryJobStore::new());
    let store = Arc::new(EnqueueDuringClaim {
        inner: inner.clone(),
        pending: Mutex::new(Some(NewJob::new("noop", json!({})))),
    });
    let registry = JobRegistry::new()
        .with_handler("noop", handler_fn(|_ctx| async { Ok(()) }))
        .unwrap();
    let config = SchedulerConfig {
        poll_interval_ms: 60_000,
        jitter_ms: 0,
        check_queued_jobs: QueuedJobsStrategy::Notify,
        ..fast_config()
    };
    let scheduler = Arc::new(
        Scheduler::new(
            config,
            store,
            Arc::new(registry),
            RetryPolicy::default(),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );
    let shutdown = CancellationToken::new();
    let handle = scheduler.clone().start(shutdown.clone());

    // Without the early wake-up this would sit out the full poll interval.
    wait_until(|| {
        let inner = inner.clone();
        async move { inner.counts().await.unwrap().succeeded == 1 }
    })
    .await;

    shutdown.cancel();
    assert!(handle.wait_for_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_two_schedulers_never_run_a_job_twice() {
    let store = Arc::new(MemoryJobStore::new());
    let runs: Arc<Mutex<HashMap<JobId, u32>>> = Arc::new(Mutex::new(HashMap::new()));

    let mut schedulers = Vec::new();
    for name in ["alpha", "beta"] {
        let runs = runs.clone();
        let registry = JobRegistry::new()
            .with_handler(
                "count",
                handler_fn(move |ctx: JobContext| {
                    let runs = runs.clone();
                    async move {
                        *runs.lock().entry(ctx.job_id).or_default() += 1;
                        tokio::task::yield_now().await;
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let config = SchedulerConfig {
            server_name: name.to_string(),
            ..fast_config()
        };
        schedulers.push(Arc::new(
            Scheduler::new(
                config,
                store.clone(),
                Arc::new(registry),
                RetryPolicy::default(),
                Arc::new(SystemClock),
            )
            .unwrap(),
        ));
    }

    for _ in 0..40 {
        store.enqueue(NewJob::new("count", json!({}))).await.unwrap();
    }

    let shutdown = CancellationToken::new();
    let handles: Vec<SchedulerHandle> = schedulers
        .iter()
        .map(|s| s.clone().start(shutdown.clone()))
        .collect();

    wait_until(|| {
        let store = store.clone();
        async move { store.counts().await.unwrap().succeeded == 40 }
    })
    .await;
    shutdown.cancel();
    for handle in handles {
        assert!(handle.wait_for_shutdown(Duration::from_secs(5)).await);
    }

    let runs = runs.lock();
    assert_eq!(runs.len(), 40);
    assert!(runs.values().all(|&n| n == 1));
}

#[tokio::test]
async fn test_shutdown_grace_elapses_with_running_job() {
    let store = Arc::new(MemoryJobStore::new());
    let registry = JobRegistry::new()
        .with_handler(
            "slow",
            handler_fn(|_ctx| async {
                sleep(Duration::from_secs(30)).await;
                Ok(())
            }),
        )
        .unwrap();
    let scheduler = Arc::new(
        Scheduler::new(
            fast_config(),
            store.clone(),
            Arc::new(registry),
            RetryPolicy::default(),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );
    store.enqueue(NewJob::new("slow", json!({}))).await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = scheduler.clone().start(shutdown.clone());
    wait_until(|| {
        let scheduler = scheduler.clone();
        async move { scheduler.stats().in_flight() == 1 }
    })
    .await;

    handle.shutdown();
    assert!(!handle.wait_for_shutdown(Duration::from_millis(50)).await);
}
