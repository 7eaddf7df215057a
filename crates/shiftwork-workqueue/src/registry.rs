//! Job type → handler table.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{JobError, RegistryError};
use crate::job::{JobId, JobRecord};
use crate::store::JobStore;

/// Executes one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one attempt of the job.
    async fn handle(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// What a handler sees of the job it runs.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub queue: String,
    pub payload: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    cancel: CancellationToken,
    store: Arc<dyn JobStore>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl JobContext {
    /// Build the context for a claimed job.
    pub fn new(job: &JobRecord, cancel: CancellationToken, store: Arc<dyn JobStore>) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue: job.queue.clone(),
            payload: job.payload.clone(),
            attempt: job.attempt_count,
            cancel,
            store,
        }
    }

    /// Deserialize the payload into the handler's argument type.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::Deserialization(e.to_string()))
    }

    /// Whether the worker gave up on this attempt.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Append a line to the job's console output.
    ///
    /// Console output is best effort; a store error is logged, not returned.
    pub async fn write_line(&self, line: &str) {
        if let Err(e) = self.store.append_console(self.job_id, line).await {
            warn!(job.id = %self.job_id, error = %e, "Failed to append console line");
        }
    }
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send,
{
    async fn handle(&self, ctx: &JobContext) -> Result<(), JobError> {
        (self.f)(ctx.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Registered handlers keyed by job type.
///
/// Filled at startup, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a second registration of the same type is an error.
    pub fn register(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), RegistryError> {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            return Err(RegistryError::Duplicate(job_type));
        }
        self.handlers.insert(job_type, handler);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler(
        mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self, RegistryError> {
        self.register(job_type, handler)?;
        Ok(self)
    }

    /// Look up the handler for a job type.
    pub fn resolve(&self, job_type: &str) -> Result<Arc<dyn JobHandler>, RegistryError> {
        self.handlers
            .get(job_type)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(job_type.to_string()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use crate::memory::MemoryJobStore;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    fn noop() -> Arc<dyn JobHandler> {
        handler_fn(|_ctx| async { Ok(()) })
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = JobRegistry::new()
            .with_handler("send_email", noop())
            .unwrap()
            .with_handler("resize_image", noop())
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("send_email"));
        assert!(registry.resolve("send_email").is_ok());
        assert_eq!(registry.job_types(), vec!["resize_image", "send_email"]);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = JobRegistry::new();
        registry.register("send_email", noop()).unwrap();
        let err = registry.register("send_email", noop()).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(t) if t == "send_email"));
    }

    #[test]
    fn test_resolve_missing() {
        let registry = JobRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve("nope"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[derive(Deserialize)]
    struct Email {
        to: String,
    }

    #[tokio::test]
    async fn test_context_payload_and_console() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store
            .enqueue(NewJob::new("send_email", json!({"to": "ops@example.com"})))
            .await
            .unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        let ctx = JobContext::new(&job, CancellationToken::new(), store.clone());

        let email: Email = ctx.payload().unwrap();
        assert_eq!(email.to, "ops@example.com");
        assert!(matches!(
            ctx.payload::<Vec<u8>>(),
            Err(JobError::Deserialization(_))
        ));

        ctx.write_line("sent").await;
        let lines = store.console(id).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "sent");
        assert!(lines[0].written_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_handler_fn_sees_context() {
        let store = Arc::new(MemoryJobStore::new());
        let id = store.enqueue(NewJob::new("echo", json!(5))).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        let token = CancellationToken::new();
        let ctx = JobContext::new(&job, token.clone(), store);

        let handler = handler_fn(|ctx: JobContext| async move {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let n: u32 = ctx.payload()?;
            if n == 5 { Ok(()) } else { Err(JobError::retryable("wrong")) }
        });
        assert!(handler.handle(&ctx).await.is_ok());
        token.cancel();
        assert!(matches!(handler.handle(&ctx).await, Err(JobError::Cancelled)));
    }
}
