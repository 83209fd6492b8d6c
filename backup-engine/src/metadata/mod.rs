//! Durable backup metadata: run snapshots, the copied file lists, the
//! per-table log timestamp map, the global start code and named backup sets.
//!
//! Every operation is atomic on its own. Nothing here spans operations with a
//! transaction; callers order their writes instead.

pub mod connection;
pub mod migrate;
pub mod sqlite;
pub mod table;

pub use sqlite::SqliteMetadataStore;
pub use table::TableMetadataStore;

use crate::model::{BackupRun, BackupState, ServerTimestamps, TableName, TimestampMap};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert the first snapshot of a run. Backup ids are unique.
    async fn create_backup_run(&self, run: &BackupRun) -> Result<()>;

    /// Overwrite the snapshot of an existing run.
    async fn update_backup_run(&self, run: &BackupRun) -> Result<()>;

    async fn get_backup_run(&self, backup_id: &str) -> Result<Option<BackupRun>>;

    /// Snapshots ordered by backup id, optionally restricted to one state.
    async fn list_backup_runs(&self, state: Option<BackupState>) -> Result<Vec<BackupRun>>;

    /// Record the log segments copied into a run's image, in order.
    async fn record_wal_files(&self, backup_id: &str, files: &[PathBuf]) -> Result<()>;

    async fn read_wal_files(&self, backup_id: &str) -> Result<Vec<PathBuf>>;

    /// The full per-table map across every table ever backed up.
    async fn read_log_timestamp_map(&self) -> Result<TimestampMap>;

    /// Replace the entries of `tables` with `timestamps`; other tables are untouched.
    async fn write_region_server_log_timestamps(
        &self,
        tables: &BTreeSet<TableName>,
        timestamps: &ServerTimestamps,
    ) -> Result<()>;

    async fn read_start_code(&self) -> Result<Option<u64>>;

    async fn write_start_code(&self, start_code: u64) -> Result<()>;

    /// Tables of a named backup set, `None` when the set is unknown.
    async fn describe_backup_set(&self, name: &str) -> Result<Option<Vec<TableName>>>;

    async fn add_backup_set(&self, name: &str, tables: &[TableName]) -> Result<()>;
}

/// Timestamps are stored as signed 64-bit integers.
pub(crate) fn to_stored_ts(ts: u64) -> Result<i64> {
    i64::try_from(ts).map_err(|_| BackupError::Metadata(format!("timestamp {ts} is out of range")))
}

pub(crate) fn from_stored_ts(ts: i64) -> Result<u64> {
    u64::try_from(ts).map_err(|_| BackupError::Metadata(format!("negative timestamp {ts} in store")))
}
