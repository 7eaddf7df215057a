//! Versioned schema for the SQLite store.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Error;

use crate::error::StoreError;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 3;

/// What to do when the stored schema is older than [`SCHEMA_VERSION`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStrategy {
    /// Apply the pending migration steps in order.
    #[default]
    Migrate,
    /// Drop every table and start empty.
    Drop,
    /// Refuse to open.
    None,
}

/// Result of schema preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaReport {
    Created,
    UpToDate,
    Migrated { from: u32 },
    Recreated { from: u32 },
}

/// Ordered migration steps; step `n` upgrades version `n - 1` to `n`.
fn migrations(p: &str) -> [(u32, String); 3] {
    [
        (
            1,
            format!(
                r#"
CREATE TABLE IF NOT EXISTS {p}_jobs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    state TEXT NOT NULL,
    queue TEXT NOT NULL,
    visible_at INTEGER NOT NULL,
    claimed_by TEXT,
    lease_expires_at INTEGER,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    idempotency_key TEXT,
    created_at INTEGER NOT NULL,
    last_state_change_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{p}_jobs_claim ON {p}_jobs(queue, state, visible_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_{p}_jobs_idempotency ON {p}_jobs(idempotency_key);
CREATE INDEX IF NOT EXISTS idx_{p}_jobs_state_change ON {p}_jobs(state, last_state_change_at);

CREATE TABLE IF NOT EXISTS {p}_schedules (
    id TEXT PRIMARY KEY,
    cron_expression TEXT NOT NULL,
    timezone TEXT NOT NULL,
    job_type TEXT NOT NULL,
    queue TEXT NOT NULL,
    payload TEXT NOT NULL,
    next_fire_at INTEGER,
    last_fire_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{p}_schedules_next ON {p}_schedules(next_fire_at);
"#
            ),
        ),
        (
            2,
            format!(
                r#"
CREATE TABLE IF NOT EXISTS {p}_console (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    written_at INTEGER NOT NULL,
    line TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_{p}_console_job ON {p}_console(job_id, seq);
"#
            ),
        ),
        (
            3,
            format!(
                r#"
ALTER TABLE {p}_jobs ADD COLUMN lease_token TEXT;
UPDATE {p}_jobs SET lease_token = lower(hex(randomblob(16))) WHERE claimed_by IS NOT NULL;
"#
            ),
        ),
    ]
}

fn data_tables(p: &str) -> [String; 3] {
    [format!("{p}_jobs"), format!("{p}_schedules"), format!("{p}_console")]
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [name],
        |row| row.get(0),
    )
}

fn stored_version(conn: &Connection, p: &str) -> Result<Option<u32>, rusqlite::Error> {
    if !table_exists(conn, &format!("{p}_meta"))? {
        return Ok(None);
    }
    conn.query_row(
        &format!("SELECT value FROM {p}_meta WHERE key = 'schema_version'"),
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map(|v| v.and_then(|s| s.parse().ok()))
}

fn copy_tables(conn: &Connection, p: &str, from: u32) -> Result<(), rusqlite::Error> {
    for table in data_tables(p) {
        if table_exists(conn, &table)? {
            let backup = format!("{table}_backup_v{from}");
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {backup}; CREATE TABLE {backup} AS SELECT * FROM {table};"
            ))?;
        }
    }
    Ok(())
}

/// Bring the schema under prefix `p` to [`SCHEMA_VERSION`].
///
/// The outer error is a database failure, the inner one a refusal to open.
pub fn prepare_schema(
    conn: &mut Connection,
    p: &str,
    strategy: MigrationStrategy,
    backup: bool,
) -> Result<Result<SchemaReport, StoreError>, Error> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {p}_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);"
    ))?;

    let current = stored_version(&tx, p)?;
    let report = match current {
        Some(v) if v == SCHEMA_VERSION => SchemaReport::UpToDate,
        Some(v) if v > SCHEMA_VERSION => {
            return Ok(Err(StoreError::Migration(format!(
                "stored schema version {v} is newer than supported version {SCHEMA_VERSION}"
            ))));
        }
        None => {
            for (_, step) in migrations(p) {
                tx.execute_batch(&step)?;
            }
            SchemaReport::Created
        }
        Some(v) => match strategy {
            MigrationStrategy::None => {
                return Ok(Err(StoreError::Migration(format!(
                    "stored schema version {v} needs migration to {SCHEMA_VERSION}, but migration is disabled"
                ))));
            }
            MigrationStrategy::Migrate => {
                if backup {
                    copy_tables(&tx, p, v)?;
                }
                for (version, step) in migrations(p) {
                    if version > v {
                        tx.execute_batch(&step)?;
                    }
                }
                SchemaReport::Migrated { from: v }
            }
            MigrationStrategy::Drop => {
                if backup {
                    copy_tables(&tx, p, v)?;
                }
                for table in data_tables(p) {
                    tx.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))?;
                }
                for (_, step) in migrations(p) {
                    tx.execute_batch(&step)?;
                }
                SchemaReport::Recreated { from: v }
            }
        },
    };

    tx.execute(
        &format!(
            "INSERT INTO {p}_meta (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ),
        params![SCHEMA_VERSION.to_string()],
    )?;
    tx.commit()?;
    Ok(Ok(report))
}

/// Table prefixes end up in SQL text, so only identifier characters are allowed.
pub fn validate_prefix(prefix: &str) -> Result<(), StoreError> {
    let valid = !prefix.is_empty()
        && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !prefix.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::Database(format!("invalid table prefix '{prefix}'")))
    }
}
