//! Persisted recurring schedule records.
//!
//! Cron evaluation lives in `shiftwork-recurring`; this module only defines
//! what the store keeps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A template that periodically produces jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSchedule {
    /// Unique schedule id.
    pub id: String,
    /// Cron expression as registered.
    pub cron_expression: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    /// Handler key for produced jobs.
    pub job_type: String,
    /// Queue for produced jobs.
    pub queue: String,
    /// Payload for produced jobs.
    pub payload: Value,
    /// Next instant a job is due (None = the expression has no future occurrence).
    pub next_fire_at: Option<DateTime<Utc>>,
    /// Scheduled instant of the most recent firing.
    pub last_fire_at: Option<DateTime<Utc>>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl RecurringSchedule {
    /// Whether a firing is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_at.is_some_and(|next| next <= now)
    }

    /// Whether the timing definition differs from `other`.
    pub fn timing_changed(&self, other: &RecurringSchedule) -> bool {
        self.cron_expression != other.cron_expression || self.timezone != other.timezone
    }
}
