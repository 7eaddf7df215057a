//! # Shiftwork Workqueue
//!
//! Persistent job queue with lease-based claiming.
//!
//! ## Features
//!
//! - Atomic claim of the oldest visible job per queue
//! - Time-bounded leases with heartbeat and expiry sweep
//! - Retry with exponential backoff and a terminal failure state
//! - Handler registry resolved once at startup
//! - Memory and SQLite storage backends

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod sqlite;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{QueuedJobsStrategy, SchedulerConfig};
pub use dispatcher::{Dispatcher, ExecutionOutcome};
pub use error::{JobError, QueueError, RegistryError, StoreError};
pub use job::{
    ConsoleLine, FailureDisposition, JobFilter, JobId, JobRecord, JobState, Lease, LeaseStatus,
    LeaseToken, NewJob, StateCounts, DEFAULT_QUEUE,
};
pub use memory::MemoryJobStore;
pub use registry::{handler_fn, JobContext, JobHandler, JobRegistry};
pub use retry::{RetryPolicy, StoreBackoff};
pub use schedule::RecurringSchedule;
pub use scheduler::{MaintenanceReport, Scheduler, SchedulerHandle, SchedulerStats};
pub use sqlite::{MigrationStrategy, SqliteJobStore, SqliteOptions};
pub use store::{JobStore, ScheduleStore};
