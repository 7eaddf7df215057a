//! SQLite job store.
//!
//! Every transition is one statement (or one immediate transaction), so
//! several processes can share the same database file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value as SqlValue};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};
use tokio::sync::Notify;
use tokio_rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{add_std, Clock, SystemClock};
use crate::error::StoreError;
use crate::job::{
    ConsoleLine, FailureDisposition, JobFilter, JobId, JobRecord, JobState, Lease, LeaseStatus,
    LeaseToken, NewJob, StateCounts,
};
use crate::store::JobStore;

#[path = "sqlite_schema.rs"]
mod schema;
pub use schema::{MigrationStrategy, SchemaReport, SCHEMA_VERSION};

#[path = "sqlite_schedules.rs"]
mod schedules;

#[cfg(test)]
#[path = "sqlite_tests.rs"]
mod tests;

const JOB_COLUMNS: &str = "id, job_type, payload, state, queue, visible_at, claimed_by, \
     lease_expires_at, attempt_count, last_error, idempotency_key, created_at, last_state_change_at, \
     lease_token";

const LEASED: &str = "('claimed', 'processing')";
const TERMINAL: &str = "('succeeded', 'failed', 'deleted')";

/// Connection settings for [`SqliteJobStore`].
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Database file; `None` for a private in-memory database.
    pub path: Option<PathBuf>,
    /// Prefix of every table name.
    pub prefix: String,
    /// Ping the database before returning from `open`.
    pub check_connection: bool,
    /// Behaviour when the stored schema is outdated.
    pub migration: MigrationStrategy,
    /// Copy the existing tables before migrating or dropping them.
    pub backup_before_migrate: bool,
    /// How long a statement waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            path: None,
            prefix: "shiftwork".to_string(),
            check_connection: true,
            migration: MigrationStrategy::default(),
            backup_before_migrate: false,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteOptions {
    /// Options for a database file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Options for a private in-memory database.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_migration(mut self, migration: MigrationStrategy) -> Self {
        self.migration = migration;
        self
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup_before_migrate = backup;
        self
    }
}

/// Job and schedule store backed by SQLite.
///
/// Change notifications cover writes made through this handle only; other
/// processes are picked up by polling.
pub struct SqliteJobStore {
    conn: Connection,
    prefix: Arc<str>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match e {
            tokio_rusqlite::Error::ConnectionClosed => {
                StoreError::Unavailable("connection closed".to_string())
            }
            tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(err, msg))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Unavailable(msg.unwrap_or_else(|| err.to_string()))
            }
            tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(err, msg))
                if err.code == ErrorCode::CannotOpen =>
            {
                StoreError::Unavailable(msg.unwrap_or_else(|| err.to_string()))
            }
            tokio_rusqlite::Error::Rusqlite(e @ rusqlite::Error::FromSqlConversionFailure(..)) => {
                StoreError::Serialization(e.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

fn conversion_error<E>(idx: usize, ty: Type, e: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, e.into())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp {ms} out of range")))
}

fn opt_from_millis(idx: usize, ms: Option<i64>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|ms| from_millis(idx, ms)).transpose()
}

fn parse_id(idx: usize, s: &str) -> rusqlite::Result<JobId> {
    Uuid::parse_str(s).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn parse_json(idx: usize, s: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(s).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let id: String = row.get(0)?;
    let payload: String = row.get(2)?;
    let state: String = row.get(3)?;
    let claimed_by: Option<String> = row.get(6)?;
    let lease_expires_at = opt_from_millis(7, row.get(7)?)?;
    let lease_token: Option<String> = row.get(13)?;
    let lease_token = lease_token.map(|t| parse_id(13, &t)).transpose()?;

    Ok(JobRecord {
        id: parse_id(0, &id)?,
        job_type: row.get(1)?,
        payload: parse_json(2, &payload)?,
        state: state.parse::<JobState>().map_err(|e: String| conversion_error(3, Type::Text, e))?,
        queue: row.get(4)?,
        visible_at: from_millis(5, row.get(5)?)?,
        claimed_by: match (claimed_by, lease_token, lease_expires_at) {
            (Some(worker_id), Some(token), Some(expires_at)) => Some(Lease {
                worker_id,
                token,
                expires_at,
            }),
            _ => None,
        },
        attempt_count: row.get(8)?,
        last_error: row.get(9)?,
        idempotency_key: row.get(10)?,
        created_at: from_millis(11, row.get(11)?)?,
        last_state_change_at: from_millis(12, row.get(12)?)?,
    })
}

fn lease_status(rows: usize) -> LeaseStatus {
    if rows == 1 {
        LeaseStatus::Held
    } else {
        LeaseStatus::Lost
    }
}

impl SqliteJobStore {
    /// Open a store on the system clock.
    pub async fn open(options: SqliteOptions) -> Result<Self, StoreError> {
        Self::open_with_clock(options, Arc::new(SystemClock)).await
    }

    /// Open a store reading time from `clock`.
    pub async fn open_with_clock(
        options: SqliteOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        schema::validate_prefix(&options.prefix)?;

        let conn = match &options.path {
            Some(path) => Connection::open(path.clone()).await?,
            None => Connection::open_in_memory().await?,
        };

        let prefix = options.prefix.clone();
        let busy_timeout = options.busy_timeout;
        let migration = options.migration;
        let backup = options.backup_before_migrate;
        let report = conn
            .call(move |conn| {
                conn.busy_timeout(busy_timeout)?;
                // In-memory databases report "memory" and ignore WAL.
                let _mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                schema::prepare_schema(conn, &prefix, migration, backup)
            })
            .await??;

        match report {
            SchemaReport::Created => info!(prefix = %options.prefix, "Created job store schema"),
            SchemaReport::UpToDate => debug!(prefix = %options.prefix, "Job store schema up to date"),
            SchemaReport::Migrated { from } => info!(
                prefix = %options.prefix,
                from,
                to = SCHEMA_VERSION,
                "Migrated job store schema"
            ),
            SchemaReport::Recreated { from } => info!(
                prefix = %options.prefix,
                from,
                "Dropped and recreated job store schema"
            ),
        }

        let store = Self {
            conn,
            prefix: Arc::from(options.prefix.as_str()),
            clock,
            notify: Arc::new(Notify::new()),
        };
        if options.check_connection {
            store.ping().await?;
        }
        Ok(store)
    }

    fn table(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, tokio_rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        Ok(self.conn.call(f).await?)
    }

    async fn update_leased(&self, sql: String, values: Vec<SqlValue>) -> Result<LeaseStatus, StoreError> {
        let rows = self
            .call(move |conn| Ok(conn.execute(&sql, params_from_iter(values))?))
            .await?;
        Ok(lease_status(rows))
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        let record = JobRecord::from_new(job, self.clock.now());
        let payload = serde_json::to_string(&record.payload)?;
        let jobs = self.table("jobs");

        let (inserted, id) = self
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let inserted = tx.execute(
                    &format!(
                        "INSERT OR IGNORE INTO {jobs} (id, job_type, payload, state, queue, visible_at,
                             attempt_count, idempotency_key, created_at, last_state_change_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)"
                    ),
                    params![
                        record.id.to_string(),
                        record.job_type,
                        payload,
                        record.state.as_str(),
                        record.queue,
                        to_millis(record.visible_at),
                        record.idempotency_key,
                        to_millis(record.created_at),
                    ],
                )? == 1;
                let id = match (&record.idempotency_key, inserted) {
                    (_, true) => record.id,
                    (Some(key), false) => {
                        let existing: String = tx.query_row(
                            &format!("SELECT id FROM {jobs} WHERE idempotency_key = ?1"),
                            [key],
                            |row| row.get(0),
                        )?;
                        parse_id(0, &existing)?
                    }
                    (None, false) => {
                        return Err(tokio_rusqlite::Error::Other(
                            format!("job {} was not inserted", record.id).into(),
                        ));
                    }
                };
                tx.commit()?;
                Ok((inserted, id))
            })
            .await?;

        if inserted {
            self.notify.notify_waiters();
        } else {
            debug!(job.id = %id, "Duplicate idempotency key, skipping enqueue");
        }
        Ok(id)
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<JobRecord>, StoreError> {
        let now = self.clock.now();
        let expires_at = add_std(now, lease_duration);
        let jobs = self.table("jobs");
        let queue = queue.to_string();
        let worker_id = worker_id.to_string();
        let token = Uuid::new_v4().to_string();

        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let job = tx
                .query_row(
                    &format!(
                        "UPDATE {jobs}
                         SET state = 'claimed', claimed_by = ?1, lease_expires_at = ?2,
                             attempt_count = attempt_count + 1, last_state_change_at = ?3,
                             lease_token = ?5
                         WHERE id = (
                             SELECT id FROM {jobs}
                             WHERE queue = ?4 AND visible_at <= ?3
                               AND (state = 'enqueued'
                                    OR (state IN {LEASED} AND lease_expires_at < ?3))
                             ORDER BY visible_at, created_at
                             LIMIT 1
                         )
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![worker_id, to_millis(expires_at), to_millis(now), queue, token],
                    job_from_row,
                )
                .optional()?;
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    async fn start_processing(&self, id: JobId, token: LeaseToken) -> Result<LeaseStatus, StoreError> {
        let sql = format!(
            "UPDATE {} SET state = 'processing', last_state_change_at = ?1
             WHERE id = ?2 AND lease_token = ?3 AND state = 'claimed'",
            self.table("jobs")
        );
        self.update_leased(
            sql,
            vec![
                SqlValue::Integer(to_millis(self.clock.now())),
                SqlValue::Text(id.to_string()),
                SqlValue::Text(token.to_string()),
            ],
        )
        .await
    }

    async fn heartbeat(
        &self,
        id: JobId,
        token: LeaseToken,
        lease_duration: Duration,
    ) -> Result<LeaseStatus, StoreError> {
        let sql = format!(
            "UPDATE {} SET lease_expires_at = ?1
             WHERE id = ?2 AND lease_token = ?3 AND state IN {LEASED}",
            self.table("jobs")
        );
        self.update_leased(
            sql,
            vec![
                SqlValue::Integer(to_millis(add_std(self.clock.now(), lease_duration))),
                SqlValue::Text(id.to_string()),
                SqlValue::Text(token.to_string()),
            ],
        )
        .await
    }

    async fn complete(&self, id: JobId, token: LeaseToken) -> Result<LeaseStatus, StoreError> {
        let sql = format!(
            "UPDATE {} SET state = 'succeeded', claimed_by = NULL, lease_expires_at = NULL,
                 lease_token = NULL, last_state_change_at = ?1
             WHERE id = ?2 AND lease_token = ?3 AND state IN {LEASED}",
            self.table("jobs")
        );
        self.update_leased(
            sql,
            vec![
                SqlValue::Integer(to_millis(self.clock.now())),
                SqlValue::Text(id.to_string()),
                SqlValue::Text(token.to_string()),
            ],
        )
        .await
    }

    async fn fail(
        &self,
        id: JobId,
        token: LeaseToken,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<LeaseStatus, StoreError> {
        let (state, visible_at) = match disposition {
            FailureDisposition::Retry { at } => (JobState::Enqueued, SqlValue::Integer(to_millis(at))),
            FailureDisposition::Terminal => (JobState::Failed, SqlValue::Null),
        };
        let sql = format!(
            "UPDATE {} SET state = ?1, visible_at = COALESCE(?2, visible_at), last_error = ?3,
                 claimed_by = NULL, lease_expires_at = NULL, lease_token = NULL,
                 last_state_change_at = ?4
             WHERE id = ?5 AND lease_token = ?6 AND state IN {LEASED}",
            self.table("jobs")
        );
        let status = self
            .update_leased(
                sql,
                vec![
                    SqlValue::Text(state.as_str().to_string()),
                    visible_at,
                    SqlValue::Text(error.to_string()),
                    SqlValue::Integer(to_millis(self.clock.now())),
                    SqlValue::Text(id.to_string()),
                    SqlValue::Text(token.to_string()),
                ],
            )
            .await?;
        if status == LeaseStatus::Held && state == JobState::Enqueued {
            self.notify.notify_waiters();
        }
        Ok(status)
    }

    async fn sweep_expired_leases(&self) -> Result<u64, StoreError> {
        let now = to_millis(self.clock.now());
        let jobs = self.table("jobs");
        let swept = self
            .call(move |conn| {
                Ok(conn.execute(
                    &format!(
                        "UPDATE {jobs} SET state = 'enqueued', claimed_by = NULL,
                             lease_expires_at = NULL, lease_token = NULL, last_state_change_at = ?1
                         WHERE state IN {LEASED} AND lease_expires_at < ?1"
                    ),
                    [now],
                )?)
            })
            .await? as u64;
        if swept > 0 {
            self.notify.notify_waiters();
        }
        Ok(swept)
    }

    async fn promote_scheduled(&self) -> Result<u64, StoreError> {
        let now = to_millis(self.clock.now());
        let jobs = self.table("jobs");
        let promoted = self
            .call(move |conn| {
                Ok(conn.execute(
                    &format!(
                        "UPDATE {jobs} SET state = 'enqueued', last_state_change_at = ?1
                         WHERE state = 'scheduled' AND visible_at <= ?1"
                    ),
                    [now],
                )?)
            })
            .await? as u64;
        if promoted > 0 {
            self.notify.notify_waiters();
        }
        Ok(promoted)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self.table("jobs");
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM {jobs} WHERE id = ?1"),
                    [id.to_string()],
                    job_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let mut conditions = Vec::new();
        let mut values = Vec::new();
        if let Some(queue) = &filter.queue {
            values.push(SqlValue::Text(queue.clone()));
            conditions.push(format!("queue = ?{}", values.len()));
        }
        if let Some(state) = filter.state {
            values.push(SqlValue::Text(state.as_str().to_string()));
            conditions.push(format!("state = ?{}", values.len()));
        }
        if let Some(job_type) = &filter.job_type {
            values.push(SqlValue::Text(job_type.clone()));
            conditions.push(format!("job_type = ?{}", values.len()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        values.push(SqlValue::Integer(
            filter.limit.map(|l| l as i64).unwrap_or(-1),
        ));
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM {} {where_clause} ORDER BY created_at DESC, rowid DESC LIMIT ?{}",
            self.table("jobs"),
            values.len()
        );

        self.call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let jobs = stmt
                .query_map(params_from_iter(values), job_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
        .await
    }

    async fn counts(&self) -> Result<StateCounts, StoreError> {
        let jobs = self.table("jobs");
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT state, COUNT(*) FROM {jobs} GROUP BY state"))?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            let mut counts = StateCounts::default();
            for row in rows {
                let (state, n) = row?;
                let state: JobState = state
                    .parse()
                    .map_err(|e: String| conversion_error(0, Type::Text, e))?;
                counts.add(state, n as u64);
            }
            Ok(counts)
        })
        .await
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        let now = to_millis(self.clock.now());
        let jobs = self.table("jobs");
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(state) = current_state(&tx, &jobs, id)? else {
                return Ok(Err(StoreError::JobNotFound(id)));
            };
            if state.is_terminal() {
                return Ok(Err(StoreError::InvalidTransition {
                    id,
                    from: state,
                    to: JobState::Deleted,
                }));
            }
            tx.execute(
                &format!(
                    "UPDATE {jobs} SET state = 'deleted', claimed_by = NULL, lease_expires_at = NULL,
                         lease_token = NULL, last_state_change_at = ?1
                     WHERE id = ?2"
                ),
                params![now, id.to_string()],
            )?;
            tx.commit()?;
            Ok(Ok(()))
        })
        .await?
    }

    async fn requeue(&self, id: JobId) -> Result<(), StoreError> {
        let now = to_millis(self.clock.now());
        let jobs = self.table("jobs");
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(state) = current_state(&tx, &jobs, id)? else {
                return Ok(Err(StoreError::JobNotFound(id)));
            };
            if !state.is_terminal() {
                return Ok(Err(StoreError::InvalidTransition {
                    id,
                    from: state,
                    to: JobState::Enqueued,
                }));
            }
            tx.execute(
                &format!(
                    "UPDATE {jobs} SET state = 'enqueued', visible_at = ?1, attempt_count = 0,
                         claimed_by = NULL, lease_expires_at = NULL, lease_token = NULL,
                         last_state_change_at = ?1
                     WHERE id = ?2"
                ),
                params![now, id.to_string()],
            )?;
            tx.commit()?;
            Ok(Ok(()))
        })
        .await??;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = to_millis(before);
        let jobs = self.table("jobs");
        let console = self.table("console");
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let expired = format!(
                "SELECT id FROM {jobs} WHERE state IN {TERMINAL} AND last_state_change_at < ?1"
            );
            tx.execute(
                &format!("DELETE FROM {console} WHERE job_id IN ({expired})"),
                [before],
            )?;
            let purged = tx.execute(
                &format!("DELETE FROM {jobs} WHERE id IN ({expired})"),
                [before],
            )?;
            tx.commit()?;
            Ok(purged as u64)
        })
        .await
    }

    async fn append_console(&self, id: JobId, line: &str) -> Result<(), StoreError> {
        let now = to_millis(self.clock.now());
        let jobs = self.table("jobs");
        let console = self.table("console");
        let line = line.to_string();
        let rows = self
            .call(move |conn| {
                Ok(conn.execute(
                    &format!(
                        "INSERT INTO {console} (job_id, written_at, line)
                         SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM {jobs} WHERE id = ?1)"
                    ),
                    params![id.to_string(), now, line],
                )?)
            })
            .await?;
        if rows == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn console(&self, id: JobId) -> Result<Vec<ConsoleLine>, StoreError> {
        let console = self.table("console");
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT written_at, line FROM {console} WHERE job_id = ?1 ORDER BY seq"
            ))?;
            let lines = stmt
                .query_map([id.to_string()], |row| {
                    Ok(ConsoleLine {
                        written_at: from_millis(0, row.get(0)?)?,
                        line: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(lines)
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    fn subscribe(&self) -> Option<Arc<Notify>> {
        Some(self.notify.clone())
    }
}

fn current_state(
    conn: &rusqlite::Connection,
    jobs: &str,
    id: JobId,
) -> rusqlite::Result<Option<JobState>> {
    let state: Option<String> = conn
        .query_row(
            &format!("SELECT state FROM {jobs} WHERE id = ?1"),
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    state
        .map(|s| s.parse::<JobState>().map_err(|e: String| conversion_error(0, Type::Text, e)))
        .transpose()
}
