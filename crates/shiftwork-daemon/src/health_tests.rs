use super::*;

use chrono::TimeZone;
use serde_json::json;
use shiftwork_workqueue::{
    JobRegistry, ManualClock, MemoryJobStore, NewJob, RetryPolicy, Scheduler, SchedulerConfig,
};

struct FixedCheck(HealthStatus);

impl HealthCheckable for FixedCheck {
    fn name(&self) -> &str {
        "fixed"
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = ComponentCheck> + Send + '_>> {
        let status = self.0;
        Box::pin(async move {
            ComponentCheck {
                name: "fixed".to_string(),
                status,
                details: None,
            }
        })
    }
}

fn clock() -> ManualClock {
    ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
}

#[test]
fn test_health_status_display() {
    assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
    assert_eq!(HealthStatus::Degraded.to_string(), "degraded");
    assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
    assert_eq!(HealthStatus::Unknown.to_string(), "unknown");
}

#[test]
fn test_health_check_result_unhealthy() {
    let result = HealthCheckResult::unhealthy("test error");
    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert_eq!(result.message, Some("test error".to_string()));
}

#[test]
fn test_health_check_result_with_checks() {
    let result = HealthCheckResult::healthy()
        .with_check(ComponentCheck::new("a", HealthStatus::Healthy, "ok"))
        .with_check(ComponentCheck::new("b", HealthStatus::Degraded, "slow"));

    assert_eq!(result.status, HealthStatus::Degraded);
    assert_eq!(result.checks.len(), 2);
    assert!(result.message.is_none());
}

#[test]
fn test_unhealthy_overrides_degraded() {
    let result = HealthCheckResult::healthy()
        .with_check(ComponentCheck::new("a", HealthStatus::Degraded, "slow"))
        .with_check(ComponentCheck::new("store", HealthStatus::Unhealthy, "down"))
        .with_check(ComponentCheck::new("c", HealthStatus::Degraded, "slow"));

    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert_eq!(result.message.as_deref(), Some("store is unhealthy"));
}

#[tokio::test]
async fn test_health_checker_counts_failures() {
    let checker = HealthChecker::new(Duration::from_secs(30));
    checker.register(Arc::new(FixedCheck(HealthStatus::Healthy))).await;

    let result = checker.check().await;
    assert_eq!(result.status, HealthStatus::Healthy);
    assert_eq!(checker.check_count(), 1);
    assert_eq!(checker.failure_count(), 0);

    checker.register(Arc::new(FixedCheck(HealthStatus::Unhealthy))).await;
    let result = checker.check().await;
    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert_eq!(checker.check_count(), 2);
    assert_eq!(checker.failure_count(), 1);

    let last = checker.last_result().await.unwrap();
    assert_eq!(last.checks.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_health_loop_runs_until_shutdown() {
    let checker = Arc::new(HealthChecker::new(Duration::from_secs(10)));
    checker.register(Arc::new(FixedCheck(HealthStatus::Healthy))).await;

    let token = CancellationToken::new();
    let task = tokio::spawn(checker.clone().start_loop(token.clone()));

    tokio::time::sleep(Duration::from_secs(35)).await;
    token.cancel();
    task.await.unwrap();

    assert_eq!(checker.check_count(), 3);
}

#[tokio::test]
async fn test_store_check() {
    let store = Arc::new(MemoryJobStore::new());
    store
        .enqueue(NewJob::new("console.write_line", json!("Hello")))
        .await
        .unwrap();

    let check = StoreCheck::new(store.clone());
    let result = check.check_health().await;
    assert_eq!(result.status, HealthStatus::Healthy);
    assert!(result.details.unwrap().contains("enqueued=1"));

    store.set_available(false);
    let result = check.check_health().await;
    assert_eq!(result.status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_worker_liveness_unknown_before_first_poll() {
    let check = WorkerLivenessCheck::new(
        Arc::new(SchedulerStats::default()),
        Arc::new(clock()),
        Duration::from_secs(60),
        4,
    );
    assert_eq!(check.check_health().await.status, HealthStatus::Unknown);
}

#[tokio::test]
async fn test_worker_liveness_follows_last_poll() {
    let clock = clock();
    let store = Arc::new(MemoryJobStore::with_clock(Arc::new(clock.clone())));
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        store,
        Arc::new(JobRegistry::new()),
        RetryPolicy::default(),
        Arc::new(clock.clone()),
    )
    .unwrap();

    let check = WorkerLivenessCheck::new(
        scheduler.stats(),
        Arc::new(clock.clone()),
        Duration::from_secs(60),
        4,
    );

    scheduler.run_once("default").await.unwrap();
    clock.advance(Duration::from_secs(30));
    assert_eq!(check.check_health().await.status, HealthStatus::Healthy);

    clock.advance(Duration::from_secs(600));
    let result = check.check_health().await;
    assert_eq!(result.status, HealthStatus::Unhealthy);
    assert!(result.details.unwrap().contains("630s"));
}
