//! Metadata store on a local SQLite database.

use super::connection::{create_pool, DbPool};
use super::migrate::migrate;
use super::{from_stored_ts, to_stored_ts, MetadataStore};
use crate::config::MetadataConfig;
use crate::model::{
    join_table_names, parse_table_names, BackupRun, BackupState, ServerTimestamps, TableName,
    TimestampMap,
};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

const START_CODE_KEY: &str = "start_code";

#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: DbPool,
}

impl SqliteMetadataStore {
    /// Open (creating if needed) the database at `db_path` and migrate it.
    pub fn open(db_path: &Path, pool_size: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let pool = create_pool(db_path, pool_size)?;
        migrate(&pool)?;
        Ok(Self { pool })
    }

    pub fn from_config(config: &MetadataConfig) -> Result<Self> {
        Self::open(&config.db_path, config.pool_size)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

fn snapshot_of(run: &BackupRun) -> Result<String> {
    Ok(serde_json::to_string(run)?)
}

fn run_from_snapshot(snapshot: &str) -> Result<BackupRun> {
    Ok(serde_json::from_str(snapshot)?)
}

fn setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM settings WHERE key = ?", params![key], |row| {
            row.get::<_, String>(0)
        })
        .optional()?)
}

fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn create_backup_run(&self, run: &BackupRun) -> Result<()> {
        let snapshot = snapshot_of(run)?;
        let id = run.backup_id.clone();
        let state = run.state().as_str();
        let phase = run.phase().to_string();
        let root = run.target_root_dir.to_string_lossy().into_owned();

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO backup_runs (backup_id, state, phase, target_root_dir, snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, state, phase, root, snapshot],
            )?;
            if inserted == 0 {
                return Err(BackupError::Metadata(format!("backup run {id} already exists")));
            }
            debug!(backup_id = %id, "Created backup run record");
            Ok(())
        })
        .await
    }

    async fn update_backup_run(&self, run: &BackupRun) -> Result<()> {
        let snapshot = snapshot_of(run)?;
        let id = run.backup_id.clone();
        let state = run.state().as_str();
        let phase = run.phase().to_string();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE backup_runs SET state = ?2, phase = ?3, snapshot = ?4, updated_at = datetime('now')
                 WHERE backup_id = ?1",
                params![id, state, phase, snapshot],
            )?;
            if updated == 0 {
                return Err(BackupError::Metadata(format!("backup run {id} not found")));
            }
            Ok(())
        })
        .await
    }

    async fn get_backup_run(&self, backup_id: &str) -> Result<Option<BackupRun>> {
        let id = backup_id.to_string();
        self.with_conn(move |conn| {
            let snapshot = conn
                .query_row(
                    "SELECT snapshot FROM backup_runs WHERE backup_id = ?",
                    params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            snapshot.as_deref().map(run_from_snapshot).transpose()
        })
        .await
    }

    async fn list_backup_runs(&self, state: Option<BackupState>) -> Result<Vec<BackupRun>> {
        self.with_conn(move |conn| {
            let snapshots = match state {
                Some(state) => {
                    let mut stmt = conn.prepare(
                        "SELECT snapshot FROM backup_runs WHERE state = ? ORDER BY backup_id",
                    )?;
                    let rows = stmt.query_map(params![state.as_str()], |row| row.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare("SELECT snapshot FROM backup_runs ORDER BY backup_id")?;
                    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            snapshots.iter().map(|s| run_from_snapshot(s)).collect()
        })
        .await
    }

    async fn record_wal_files(&self, backup_id: &str, files: &[PathBuf]) -> Result<()> {
        let id = backup_id.to_string();
        let files: Vec<String> = files
            .iter()
            .map(|f| f.to_string_lossy().into_owned())
            .collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO wal_files (backup_id, seq, path) VALUES (?1, ?2, ?3)",
                )?;
                for (seq, path) in files.iter().enumerate() {
                    stmt.execute(params![id, seq as i64, path])?;
                }
            }
            tx.commit()?;
            debug!(backup_id = %id, files = files.len(), "Recorded WAL files");
            Ok(())
        })
        .await
    }

    async fn read_wal_files(&self, backup_id: &str) -> Result<Vec<PathBuf>> {
        let id = backup_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT path FROM wal_files WHERE backup_id = ? ORDER BY seq")?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            let paths = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(paths.into_iter().map(PathBuf::from).collect())
        })
        .await
    }

    async fn read_log_timestamp_map(&self) -> Result<TimestampMap> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT table_name, server, ts FROM log_timestamps")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;

            let mut map = TimestampMap::new();
            for row in rows {
                let (table, server, ts) = row?;
                let table: TableName = table.parse()?;
                map.entry(table).or_default().insert(server, from_stored_ts(ts)?);
            }
            Ok(map)
        })
        .await
    }

    async fn write_region_server_log_timestamps(
        &self,
        tables: &BTreeSet<TableName>,
        timestamps: &ServerTimestamps,
    ) -> Result<()> {
        let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        let timestamps = timestamps
            .iter()
            .map(|(server, ts)| Ok((server.clone(), to_stored_ts(*ts)?)))
            .collect::<Result<Vec<_>>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for table in &tables {
                tx.execute("DELETE FROM log_timestamps WHERE table_name = ?", params![table])?;
                for (server, ts) in &timestamps {
                    tx.execute(
                        "INSERT INTO log_timestamps (table_name, server, ts) VALUES (?1, ?2, ?3)",
                        params![table, server, ts],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn read_start_code(&self) -> Result<Option<u64>> {
        self.with_conn(|conn| {
            setting(conn, START_CODE_KEY)?
                .map(|v| {
                    v.parse::<u64>().map_err(|_| {
                        BackupError::Metadata(format!("invalid start code '{v}' in store"))
                    })
                })
                .transpose()
        })
        .await
    }

    async fn write_start_code(&self, start_code: u64) -> Result<()> {
        self.with_conn(move |conn| set_setting(conn, START_CODE_KEY, &start_code.to_string()))
            .await
    }

    async fn describe_backup_set(&self, name: &str) -> Result<Option<Vec<TableName>>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tables = conn
                .query_row(
                    "SELECT tables FROM backup_sets WHERE name = ?",
                    params![name],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            match tables {
                Some(list) => Ok(Some(parse_table_names(Some(&list))?.unwrap_or_default())),
                None => Ok(None),
            }
        })
        .await
    }

    async fn add_backup_set(&self, name: &str, tables: &[TableName]) -> Result<()> {
        let name = name.to_string();
        let list = join_table_names(tables);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backup_sets (name, tables) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET tables = excluded.tables",
                params![name, list],
            )?;
            Ok(())
        })
        .await
    }
}
