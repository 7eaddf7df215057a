//! Health checking for a running server.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shiftwork_workqueue::{Clock, JobStore, SchedulerStats};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Health status of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Server is healthy.
    Healthy,
    /// Server is degraded but functioning.
    Degraded,
    /// Server is unhealthy.
    Unhealthy,
    /// Health status is unknown.
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health check result with details.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Overall health status.
    pub status: HealthStatus,
    /// Timestamp of the check.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Individual component checks.
    pub checks: Vec<ComponentCheck>,
    /// Optional message.
    pub message: Option<String>,
}

/// Individual component health check.
#[derive(Debug, Clone)]
pub struct ComponentCheck {
    /// Component name.
    pub name: String,
    /// Component health status.
    pub status: HealthStatus,
    /// Optional details.
    pub details: Option<String>,
}

impl ComponentCheck {
    fn new(name: &str, status: HealthStatus, details: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            details: Some(details.into()),
        }
    }
}

impl HealthCheckResult {
    /// Create a healthy result.
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            timestamp: chrono::Utc::now(),
            checks: Vec::new(),
            message: None,
        }
    }

    /// Create an unhealthy result.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            timestamp: chrono::Utc::now(),
            checks: Vec::new(),
            message: Some(message.into()),
        }
    }

    /// Add a component check. The overall status is the worst component's.
    pub fn with_check(mut self, check: ComponentCheck) -> Self {
        if check.status == HealthStatus::Unhealthy {
            self.status = HealthStatus::Unhealthy;
            if self.message.is_none() {
                self.message = Some(format!("{} is unhealthy", check.name));
            }
        } else if check.status == HealthStatus::Degraded && self.status != HealthStatus::Unhealthy {
            self.status = HealthStatus::Degraded;
        }
        self.checks.push(check);
        self
    }
}

/// Trait for components that can be health-checked.
/// Uses boxed futures for dyn compatibility.
pub trait HealthCheckable: Send + Sync {
    /// Get the component name.
    fn name(&self) -> &str;

    /// Perform a health check.
    fn check_health(&self) -> Pin<Box<dyn Future<Output = ComponentCheck> + Send + '_>>;
}

/// Health checker that periodically checks server health.
pub struct HealthChecker {
    interval: Duration,
    components: RwLock<Vec<Arc<dyn HealthCheckable>>>,
    last_check: RwLock<Option<HealthCheckResult>>,
    check_count: AtomicU64,
    failure_count: AtomicU64,
}

impl HealthChecker {
    /// Create a new health checker running every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            components: RwLock::new(Vec::new()),
            last_check: RwLock::new(None),
            check_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    /// Register a component for health checking.
    pub async fn register(&self, component: Arc<dyn HealthCheckable>) {
        let mut components = self.components.write().await;
        info!("Registered health check component: {}", component.name());
        components.push(component);
    }

    /// Perform a health check on all components.
    pub async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();
        self.check_count.fetch_add(1, Ordering::SeqCst);

        let components = self.components.read().await;
        let mut result = HealthCheckResult::healthy();

        for component in components.iter() {
            let check = component.check_health().await;
            debug!("Health check for {}: {}", check.name, check.status);
            result = result.with_check(check);
        }

        let elapsed = start.elapsed();
        debug!("Health check completed in {:?}: {}", elapsed, result.status);

        if result.status == HealthStatus::Unhealthy {
            self.failure_count.fetch_add(1, Ordering::SeqCst);
            warn!("Health check failed: {:?}", result.message);
        }

        *self.last_check.write().await = Some(result.clone());
        result
    }

    /// Get the last health check result.
    pub async fn last_result(&self) -> Option<HealthCheckResult> {
        self.last_check.read().await.clone()
    }

    /// Get the total number of health checks performed.
    pub fn check_count(&self) -> u64 {
        self.check_count.load(Ordering::SeqCst)
    }

    /// Get the number of failed health checks.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Run checks every interval until `shutdown` is cancelled.
    pub async fn start_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting health check loop (interval: {:?})", self.interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let result = self.check().await;
                    if result.status == HealthStatus::Unhealthy {
                        error!("Server health check failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Health check loop shutting down");
                    break;
                }
            }
        }
    }
}

/// Store reachability, with job counts per state as details.
pub struct StoreCheck {
    store: Arc<dyn JobStore>,
}

impl StoreCheck {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

impl HealthCheckable for StoreCheck {
    fn name(&self) -> &str {
        "store"
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = ComponentCheck> + Send + '_>> {
        Box::pin(async move {
            if let Err(e) = self.store.ping().await {
                return ComponentCheck::new(self.name(), HealthStatus::Unhealthy, e.to_string());
            }
            match self.store.counts().await {
                Ok(counts) => ComponentCheck::new(
                    self.name(),
                    HealthStatus::Healthy,
                    format!(
                        "enqueued={} scheduled={} processing={} failed={}",
                        counts.enqueued,
                        counts.scheduled,
                        counts.claimed + counts.processing,
                        counts.failed
                    ),
                ),
                Err(e) => ComponentCheck::new(self.name(), HealthStatus::Degraded, e.to_string()),
            }
        })
    }
}

/// Whether the queue loops are still asking the store for work.
pub struct WorkerLivenessCheck {
    stats: Arc<SchedulerStats>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
    worker_count: usize,
}

impl WorkerLivenessCheck {
    /// `max_age` is the longest acceptable gap since the last claim attempt.
    pub fn new(
        stats: Arc<SchedulerStats>,
        clock: Arc<dyn Clock>,
        max_age: Duration,
        worker_count: usize,
    ) -> Self {
        Self {
            stats,
            clock,
            max_age,
            worker_count,
        }
    }
}

impl HealthCheckable for WorkerLivenessCheck {
    fn name(&self) -> &str {
        "workers"
    }

    fn check_health(&self) -> Pin<Box<dyn Future<Output = ComponentCheck> + Send + '_>> {
        Box::pin(async move {
            let in_flight = self.stats.in_flight();
            let Some(last_poll) = self.stats.last_poll_at() else {
                return ComponentCheck::new(self.name(), HealthStatus::Unknown, "No poll yet");
            };

            let age = (self.clock.now() - last_poll).to_std().unwrap_or(Duration::ZERO);
            let details = format!(
                "last poll {}s ago, {}/{} workers busy, {} succeeded, {} failed",
                age.as_secs(),
                in_flight,
                self.worker_count,
                self.stats.succeeded(),
                self.stats.failed()
            );

            let status = if age <= self.max_age {
                HealthStatus::Healthy
            } else if in_flight >= self.worker_count {
                // Loops wait for a free worker before polling again.
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            };
            ComponentCheck::new(self.name(), status, details)
        })
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
