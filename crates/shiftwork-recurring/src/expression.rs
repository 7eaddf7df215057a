//! Cron expressions evaluated in an IANA timezone.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::CronError;

/// A parsed cron expression bound to a timezone.
///
/// Accepts the classic 5-field form (`minute hour day month weekday`), the
/// 6/7-field form with seconds (and year), and the `@hourly`-style macros.
/// Numeric weekdays follow the `cron` crate (1 = Sunday); names such as
/// `MON-FRI` are unambiguous.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    /// Parse `expression` to be evaluated in `timezone`.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, CronError> {
        let timezone = Tz::from_str(timezone)
            .map_err(|_| CronError::UnknownTimezone(timezone.to_string()))?;
        let schedule = Schedule::from_str(&normalize(expression)).map_err(|e| {
            CronError::InvalidExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
            timezone,
        })
    }

    /// Expression as registered.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First occurrence strictly after `after`, or `None` if the expression
    /// has no future occurrence.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Occurrences strictly after `after` and no later than `until`, at most `limit`.
    pub fn occurrences_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .map(|t| t.with_timezone(&Utc))
            .take_while(|t| *t <= until)
            .take(limit)
            .collect()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronSchedule")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

/// Add a zero seconds field to 5-field expressions.
fn normalize(expression: &str) -> String {
    let expression = expression.trim();
    if !expression.starts_with('@') && expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Common expressions.
pub struct Cron;

impl Cron {
    /// Every minute, at second zero.
    pub fn minutely() -> String {
        "* * * * *".to_string()
    }

    pub fn hourly() -> String {
        "0 * * * *".to_string()
    }

    /// Every day at `hour:minute`.
    pub fn daily(hour: u32, minute: u32) -> String {
        format!("{minute} {hour} * * *")
    }

    /// Every `n` minutes.
    pub fn every_minutes(n: u32) -> String {
        format!("*/{n} * * * *")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_five_field_expression() {
        let cron = CronSchedule::parse(&Cron::minutely(), "UTC").unwrap();
        assert_eq!(cron.next_after(at(12, 0, 0)), Some(at(12, 1, 0)));
        assert_eq!(cron.next_after(at(12, 0, 30)), Some(at(12, 1, 0)));
        assert_eq!(cron.expression(), "* * * * *");
    }

    #[test]
    fn test_six_field_expression() {
        let cron = CronSchedule::parse("*/15 * * * * *", "UTC").unwrap();
        assert_eq!(cron.next_after(at(12, 0, 0)), Some(at(12, 0, 15)));
    }

    #[test]
    fn test_macro_expression() {
        let cron = CronSchedule::parse("@hourly", "UTC").unwrap();
        assert_eq!(cron.next_after(at(12, 0, 0)), Some(at(13, 0, 0)));
    }

    #[test]
    fn test_timezone_is_applied() {
        // 09:00 in Paris is 08:00 UTC in winter.
        let cron = CronSchedule::parse(&Cron::daily(9, 0), "Europe/Paris").unwrap();
        assert_eq!(cron.next_after(at(0, 0, 0)), Some(at(8, 0, 0)));
        assert_eq!(cron.timezone(), chrono_tz::Europe::Paris);
    }

    #[test]
    fn test_occurrences_between() {
        let cron = CronSchedule::parse(&Cron::every_minutes(10), "UTC").unwrap();
        let all = cron.occurrences_between(at(12, 0, 0), at(12, 35, 0), 100);
        assert_eq!(all, vec![at(12, 10, 0), at(12, 20, 0), at(12, 30, 0)]);
        let capped = cron.occurrences_between(at(12, 0, 0), at(12, 35, 0), 2);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            CronSchedule::parse("not a cron", "UTC"),
            Err(CronError::InvalidExpression { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("* * * * *", "Mars/Olympus"),
            Err(CronError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_expression_without_future_occurrence() {
        let cron = CronSchedule::parse("0 0 0 1 1 * 2001", "UTC").unwrap();
        assert_eq!(cron.next_after(at(12, 0, 0)), None);
    }
}
