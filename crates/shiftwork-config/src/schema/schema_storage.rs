//! Storage configuration types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::default_true;

/// Which store backs the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    /// Process-local; jobs are lost on exit.
    Memory,
}

/// How idle queue loops notice new jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedJobsCheck {
    #[default]
    Poll,
    Notify,
}

/// What to do with an outdated stored schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    #[default]
    Migrate,
    Drop,
    None,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database file; `~` and `${VAR}` are expanded.
    #[serde(default = "default_path")]
    pub path: String,

    /// Prefix of every table name.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Ping the store at startup.
    #[serde(default = "default_true")]
    pub check_connection: bool,

    #[serde(default)]
    pub check_queued_jobs: QueuedJobsCheck,

    #[serde(default)]
    pub migration: MigrationMode,

    /// Copy existing tables before a migration touches them.
    #[serde(default = "default_true")]
    pub backup_before_migrate: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_path(),
            prefix: default_prefix(),
            check_connection: default_true(),
            check_queued_jobs: QueuedJobsCheck::default(),
            migration: MigrationMode::default(),
            backup_before_migrate: default_true(),
        }
    }
}

fn default_path() -> String {
    "~/.shiftwork/shiftwork.db".to_string()
}

fn default_prefix() -> String {
    "shiftwork".to_string()
}

impl StorageConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).as_ref())
    }
}
