//! # Shiftwork Recurring
//!
//! Turns cron schedules into enqueued jobs.
//!
//! A [`RecurringEvaluator`] periodically looks for schedules whose
//! `next_fire_at` has passed, enqueues one job per firing with an idempotency
//! key derived from the fire instant, and moves the schedule forward with a
//! compare-and-set so that several processes can evaluate the same store.

pub mod definition;
pub mod error;
pub mod evaluator;
pub mod expression;

pub use definition::RecurringJob;
pub use error::{CronError, RecurringError};
pub use evaluator::{CatchUpPolicy, EvaluatorConfig, RecurringEvaluator, TickReport};
pub use expression::{Cron, CronSchedule};
