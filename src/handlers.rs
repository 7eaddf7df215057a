//! Built-in job handlers.

use serde_json::Value;
use shiftwork_workqueue::{handler_fn, JobContext, JobError, JobRegistry, RegistryError};

pub(crate) const CONSOLE_WRITE_LINE: &str = "console.write_line";

/// Registry with every handler this binary ships.
pub(crate) fn registry() -> Result<JobRegistry, RegistryError> {
    JobRegistry::new().with_handler(CONSOLE_WRITE_LINE, handler_fn(console_write_line))
}

/// Print the payload on stdout and record it as console output of the job.
///
/// A string payload is printed as is, anything else as JSON.
async fn console_write_line(ctx: JobContext) -> Result<(), JobError> {
    let line = match &ctx.payload {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    println!("{}", line);
    ctx.write_line(&line).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use serde_json::json;
    use shiftwork_workqueue::{JobHandler, JobRecord, JobStore, MemoryJobStore, NewJob};
    use tokio_util::sync::CancellationToken;

    async fn run(payload: Value) -> Vec<String> {
        let store = Arc::new(MemoryJobStore::new());
        let id = store
            .enqueue(NewJob::new(CONSOLE_WRITE_LINE, payload.clone()))
            .await
            .unwrap();
        let job: JobRecord = store.get(id).await.unwrap().unwrap();

        let handler = registry().unwrap().resolve(CONSOLE_WRITE_LINE).unwrap();
        let ctx = JobContext::new(&job, CancellationToken::new(), store.clone());
        handler.handle(&ctx).await.unwrap();

        store
            .console(id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.line)
            .collect()
    }

    #[test]
    fn test_registry_contains_console_handler() {
        let registry = registry().unwrap();
        assert!(registry.contains(CONSOLE_WRITE_LINE));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_console_write_line_string_payload() {
        assert_eq!(run(json!("Hello")).await, vec!["Hello"]);
    }

    #[tokio::test]
    async fn test_console_write_line_structured_payload() {
        assert_eq!(run(json!({"n": 1})).await, vec![r#"{"n":1}"#]);
    }
}
