//! Recurring schedule persistence for [`SqliteJobStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{from_millis, opt_from_millis, parse_json, to_millis, SqliteJobStore};
use crate::error::StoreError;
use crate::schedule::RecurringSchedule;
use crate::store::ScheduleStore;

const SCHEDULE_COLUMNS: &str =
    "id, cron_expression, timezone, job_type, queue, payload, next_fire_at, last_fire_at, created_at";

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<RecurringSchedule> {
    let payload: String = row.get(5)?;
    Ok(RecurringSchedule {
        id: row.get(0)?,
        cron_expression: row.get(1)?,
        timezone: row.get(2)?,
        job_type: row.get(3)?,
        queue: row.get(4)?,
        payload: parse_json(5, &payload)?,
        next_fire_at: opt_from_millis(6, row.get(6)?)?,
        last_fire_at: opt_from_millis(7, row.get(7)?)?,
        created_at: from_millis(8, row.get(8)?)?,
    })
}

#[async_trait]
impl ScheduleStore for SqliteJobStore {
    async fn upsert_schedule(&self, schedule: RecurringSchedule) -> Result<(), StoreError> {
        let table = self.table("schedules");
        let payload = serde_json::to_string(&schedule.payload)?;
        self.call(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {table} ({SCHEDULE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                         next_fire_at = CASE
                             WHEN {table}.cron_expression != excluded.cron_expression
                               OR {table}.timezone != excluded.timezone
                             THEN excluded.next_fire_at
                             ELSE {table}.next_fire_at
                         END,
                         cron_expression = excluded.cron_expression,
                         timezone = excluded.timezone,
                         job_type = excluded.job_type,
                         queue = excluded.queue,
                         payload = excluded.payload"
                ),
                params![
                    schedule.id,
                    schedule.cron_expression,
                    schedule.timezone,
                    schedule.job_type,
                    schedule.queue,
                    payload,
                    schedule.next_fire_at.map(to_millis),
                    schedule.last_fire_at.map(to_millis),
                    to_millis(schedule.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<RecurringSchedule>, StoreError> {
        let table = self.table("schedules");
        let id = id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SCHEDULE_COLUMNS} FROM {table} WHERE id = ?1"),
                    [id],
                    schedule_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>, StoreError> {
        let table = self.table("schedules");
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SCHEDULE_COLUMNS} FROM {table} ORDER BY id"))?;
            let schedules = stmt
                .query_map([], schedule_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(schedules)
        })
        .await
    }

    async fn remove_schedule(&self, id: &str) -> Result<(), StoreError> {
        let table = self.table("schedules");
        let key = id.to_string();
        let removed = self
            .call(move |conn| Ok(conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), [key])?))
            .await?;
        if removed == 0 {
            return Err(StoreError::ScheduleNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<RecurringSchedule>, StoreError> {
        let table = self.table("schedules");
        let now = to_millis(now);
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM {table}
                 WHERE next_fire_at IS NOT NULL AND next_fire_at <= ?1
                 ORDER BY next_fire_at"
            ))?;
            let schedules = stmt
                .query_map([now], schedule_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(schedules)
        })
        .await
    }

    async fn record_firing(
        &self,
        id: &str,
        expected_next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let table = self.table("schedules");
        let key = id.to_string();
        let (updated, exists) = self
            .call(move |conn| {
                let updated = conn.execute(
                    &format!(
                        "UPDATE {table} SET last_fire_at = ?1, next_fire_at = ?2
                         WHERE id = ?3 AND next_fire_at = ?4"
                    ),
                    params![
                        to_millis(fired_at),
                        next_fire_at.map(to_millis),
                        key,
                        to_millis(expected_next)
                    ],
                )?;
                let exists = updated == 1
                    || conn.query_row(
                        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
                        [&key],
                        |row| row.get::<_, bool>(0),
                    )?;
                Ok((updated == 1, exists))
            })
            .await?;
        if !exists {
            return Err(StoreError::ScheduleNotFound(id.to_string()));
        }
        Ok(updated)
    }
}
