//! End-to-end tests for the scheduler running against the SQLite store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use shiftwork_workqueue::{
    handler_fn, JobContext, JobError, JobId, JobRegistry, JobState, JobStore, NewJob, RetryPolicy,
    Scheduler, SchedulerConfig, SqliteJobStore, SqliteOptions, SystemClock,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn config(name: &str) -> SchedulerConfig {
    SchedulerConfig {
        server_name: name.to_string(),
        worker_count: 2,
        poll_interval_ms: 20,
        jitter_ms: 10,
        lease_duration_secs: 2,
        heartbeat_interval_secs: 1,
        sweep_interval_secs: 1,
        ..Default::default()
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        multiplier: 2.0,
        jitter: Duration::ZERO,
    }
}

async fn open(path: &std::path::Path) -> Arc<SqliteJobStore> {
    Arc::new(SqliteJobStore::open(SqliteOptions::file(path)).await.unwrap())
}

async fn wait_for_state(store: &SqliteJobStore, id: JobId, state: JobState) {
    timeout(Duration::from_secs(15), async {
        loop {
            if let Some(job) = store.get(id).await.unwrap() {
                if job.state == state {
                    return;
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached {state:?}"));
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_servers_share_one_database() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.db");
    let runs: Arc<Mutex<HashMap<JobId, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let shutdown = CancellationToken::new();

    let mut handles = Vec::new();
    let mut stores = Vec::new();
    for name in ["alpha", "beta"] {
        let store = open(&path).await;
        let runs = runs.clone();
        let registry = JobRegistry::new()
            .with_handler(
                "count",
                handler_fn(move |ctx: JobContext| {
                    let runs = runs.clone();
                    async move {
                        *runs.lock().entry(ctx.job_id).or_default() += 1;
                        ctx.write_line("counted").await;
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let scheduler = Arc::new(
            Scheduler::new(
                config(name),
                store.clone(),
                Arc::new(registry),
                fast_retry(),
                Arc::new(SystemClock),
            )
            .unwrap(),
        );
        handles.push(scheduler.start(shutdown.clone()));
        stores.push(store);
    }

    let mut ids = Vec::new();
    for i in 0..25 {
        ids.push(stores[i % 2].enqueue(NewJob::new("count", json!(i))).await.unwrap());
    }
    for id in &ids {
        wait_for_state(&stores[0], *id, JobState::Succeeded).await;
    }

    shutdown.cancel();
    for handle in handles {
        assert!(handle.wait_for_shutdown(Duration::from_secs(5)).await);
    }

    let runs = runs.lock();
    assert_eq!(runs.len(), 25);
    assert!(runs.values().all(|&n| n == 1));
    let console = stores[1].console(ids[0]).await.unwrap();
    assert_eq!(console.len(), 1);
    assert_eq!(console[0].line, "counted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_from_crashed_worker_is_recovered() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");
    let store = open(&path).await;

    let id = store.enqueue(NewJob::new("noop", json!({}))).await.unwrap();
    // A worker that claims and then disappears without completing.
    let dead = store
        .claim("default", "dead:0/default", Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    store
        .start_processing(id, dead.lease_token().unwrap())
        .await
        .unwrap();

    let registry = JobRegistry::new()
        .with_handler("noop", handler_fn(|_ctx| async { Ok(()) }))
        .unwrap();
    let scheduler = Arc::new(
        Scheduler::new(
            config("survivor"),
            store.clone(),
            Arc::new(registry),
            fast_retry(),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );
    let shutdown = CancellationToken::new();
    let handle = scheduler.clone().start(shutdown.clone());

    wait_for_state(&store, id, JobState::Succeeded).await;
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 2);

    shutdown.cancel();
    assert!(handle.wait_for_shutdown(Duration::from_secs(5)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_job_retries_then_fails_terminally() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir.path().join("jobs.db")).await;
    let registry = JobRegistry::new()
        .with_handler(
            "flaky",
            handler_fn(|_ctx| async { Err(JobError::retryable("upstream unavailable")) }),
        )
        .unwrap();
    let scheduler = Arc::new(
        Scheduler::new(
            config("solo"),
            store.clone(),
            Arc::new(registry),
            fast_retry(),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );
    let id = store.enqueue(NewJob::new("flaky", json!({}))).await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = scheduler.clone().start(shutdown.clone());
    wait_for_state(&store, id, JobState::Failed).await;
    shutdown.cancel();
    assert!(handle.wait_for_shutdown(Duration::from_secs(5)).await);

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 3);
    assert_eq!(job.last_error.as_deref(), Some("upstream unavailable"));
    assert_eq!(scheduler.stats().retried(), 2);
    assert_eq!(scheduler.stats().failed(), 1);

    // An operator can put it back after fixing the cause.
    store.requeue(id).await.unwrap();
    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Enqueued);
}

#[tokio::test]
async fn test_restart_keeps_pending_jobs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    let id = {
        let store = open(&path).await;
        store
            .enqueue(NewJob::new("console.write_line", json!("Hello")))
            .await
            .unwrap()
    };

    let store = open(&path).await;
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
    let scheduler = Scheduler::new(
        config("restarted"),
        store.clone(),
        Arc::new(registry),
        fast_retry(),
        Arc::new(SystemClock),
    )
    .unwrap();

    assert!(scheduler.run_once("default").await.unwrap().is_some());
    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Succeeded);
    assert_eq!(store.console(id).await.unwrap()[0].line, "Hello");
}
