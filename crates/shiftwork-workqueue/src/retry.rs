//! Job retry policy and store-call backoff.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::clock::add_std;
use crate::error::{JobError, StoreError};
use crate::job::FailureDisposition;

/// Decides whether a failed attempt is retried and when.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    /// Exponential backoff multiplier.
    pub multiplier: f64,
    /// Upper bound of the uniform random delay added on top.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(3600),
            multiplier: 2.0,
            jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Deterministic part of the delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Backoff plus random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }

    /// Disposition of a job whose attempt number `attempt` failed with `error`.
    pub fn decide(&self, attempt: u32, error: &JobError, now: DateTime<Utc>) -> FailureDisposition {
        if error.is_permanent() || attempt >= self.max_attempts {
            FailureDisposition::Terminal
        } else {
            FailureDisposition::Retry {
                at: add_std(now, self.delay(attempt)),
            }
        }
    }
}

/// Exponential backoff for transient store errors.
#[derive(Debug, Clone)]
pub struct StoreBackoff {
    /// First delay.
    pub initial: Duration,
    /// Delay cap.
    pub max: Duration,
    /// Attempts before the error is surfaced.
    pub max_attempts: u32,
}

impl Default for StoreBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl StoreBackoff {
    /// Delay after the `n`-th consecutive failure (1-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let shift = n.saturating_sub(1).min(16);
        self.initial.saturating_mul(1 << shift).min(self.max)
    }

    /// Run `operation`, retrying transient errors.
    pub async fn retry_transient<F, Fut, T>(&self, what: &str, operation: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut failures = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && failures + 1 < self.max_attempts => {
                    failures += 1;
                    let delay = self.delay_for(failures);
                    warn!(
                        operation = what,
                        attempt = failures,
                        error = %e,
                        "Transient store error, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: Duration::ZERO,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_secs(10));
        assert_eq!(p.backoff(2), Duration::from_secs(20));
        assert_eq!(p.backoff(3), Duration::from_secs(40));
        assert_eq!(p.backoff(4), Duration::from_secs(60));
        assert_eq!(p.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let p = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let current = p.backoff(attempt);
            assert!(current >= previous, "attempt {attempt}");
            previous = current;
        }
    }

    #[test]
    fn test_delay_within_jitter_bounds() {
        let p = RetryPolicy {
            jitter: Duration::from_millis(500),
            ..policy()
        };
        for _ in 0..50 {
            let d = p.delay(2);
            assert!(d >= Duration::from_secs(20));
            assert!(d <= Duration::from_millis(20_500));
        }
    }

    #[test]
    fn test_decide_retries_until_exhausted() {
        let p = policy();
        let err = JobError::retryable("smtp timeout");
        assert_eq!(
            p.decide(1, &err, now()),
            FailureDisposition::Retry {
                at: now() + chrono::Duration::seconds(10)
            }
        );
        assert_eq!(p.decide(5, &err, now()), FailureDisposition::Terminal);
    }

    #[test]
    fn test_decide_permanent_is_terminal() {
        let p = policy();
        assert_eq!(
            p.decide(1, &JobError::permanent("bad address"), now()),
            FailureDisposition::Terminal
        );
    }

    #[test]
    fn test_no_retries() {
        let p = RetryPolicy::no_retries();
        assert_eq!(
            p.decide(1, &JobError::retryable("x"), now()),
            FailureDisposition::Terminal
        );
    }

    #[test]
    fn test_store_backoff_delays() {
        let b = StoreBackoff::default();
        assert_eq!(b.delay_for(1), Duration::from_millis(100));
        assert_eq!(b.delay_for(2), Duration::from_millis(200));
        assert_eq!(b.delay_for(20), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_recovers() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = StoreBackoff::default()
            .retry_transient("test", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Unavailable("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_gives_up() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = StoreBackoff::default()
            .retry_transient("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("down".into()))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_retry_transient_does_not_retry_permanent() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = StoreBackoff::default()
            .retry_transient("test", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Database("constraint".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
