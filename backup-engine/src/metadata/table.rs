//! Metadata store laid out as rows of a system table, reached through a
//! [`DataClient`].
//!
//! Row layout, all cells in family `meta`:
//!
//! | row                 | qualifier      | value                         |
//! |---------------------|----------------|-------------------------------|
//! | `session:<id>`      | `snapshot`     | run snapshot (JSON)           |
//! | `sessions`          | `<id>`         | run state                     |
//! | `wals:<id>`         | `count`        | counter                       |
//! | `wals:<id>`         | `wal:<seq>`    | copied segment path           |
//! | `rslogts:<table>`   | `<server>`     | timestamp (u64, big endian)   |
//! | `rslogts`           | `<table>`      | empty                         |
//! | `startcode`         | `startcode`    | start code (decimal)          |
//! | `set:<name>`        | `tables`       | comma-delimited table list    |

use super::MetadataStore;
use crate::client::{DataClient, Delete, Get, Put, RowResult};
use crate::model::{
    join_table_names, parse_table_names, BackupRun, BackupState, ServerTimestamps, TableName,
    TimestampMap,
};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokio::sync::Mutex;

const FAMILY: &[u8] = b"meta";
const SESSIONS_ROW: &str = "sessions";
const TIMESTAMP_INDEX_ROW: &str = "rslogts";
const START_CODE_ROW: &str = "startcode";
const SNAPSHOT: &[u8] = b"snapshot";
const WAL_COUNT: &[u8] = b"count";
const WAL_PREFIX: &str = "wal:";
const SET_TABLES: &[u8] = b"tables";

pub struct TableMetadataStore<C: DataClient> {
    // Calls are serialized; a client need not support concurrent callers
    client: Mutex<C>,
}

impl<C: DataClient> TableMetadataStore<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

fn session_row(backup_id: &str) -> String {
    format!("session:{backup_id}")
}

fn wals_row(backup_id: &str) -> String {
    format!("wals:{backup_id}")
}

fn timestamps_row(table: &TableName) -> String {
    format!("{TIMESTAMP_INDEX_ROW}:{table}")
}

fn set_row(name: &str) -> String {
    format!("set:{name}")
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| BackupError::Metadata("non UTF-8 value in metadata table".to_string()))
}

fn decode_timestamp(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| BackupError::Metadata(format!("timestamp cell of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn snapshot_of(row: &RowResult) -> Result<Option<BackupRun>> {
    row.value(FAMILY, SNAPSHOT)
        .map(|json| Ok(serde_json::from_slice(json)?))
        .transpose()
}

impl<C: DataClient> TableMetadataStore<C> {
    async fn put_snapshot(&self, client: &C, run: &BackupRun) -> Result<()> {
        let json = serde_json::to_vec(run)?;
        client
            .put(Put::new(session_row(&run.backup_id)).add_column(FAMILY, SNAPSHOT, json))
            .await?;
        client
            .put(Put::new(SESSIONS_ROW).add_column(
                FAMILY,
                run.backup_id.as_bytes(),
                run.state().as_str(),
            ))
            .await
    }
}

#[async_trait]
impl<C: DataClient> MetadataStore for TableMetadataStore<C> {
    async fn create_backup_run(&self, run: &BackupRun) -> Result<()> {
        let client = self.client.lock().await;
        if client.exists(Get::new(session_row(&run.backup_id))).await? {
            return Err(BackupError::Metadata(format!(
                "backup run {} already exists",
                run.backup_id
            )));
        }
        self.put_snapshot(&client, run).await
    }

    async fn update_backup_run(&self, run: &BackupRun) -> Result<()> {
        let client = self.client.lock().await;
        if !client.exists(Get::new(session_row(&run.backup_id))).await? {
            return Err(BackupError::Metadata(format!("backup run {} not found", run.backup_id)));
        }
        self.put_snapshot(&client, run).await
    }

    async fn get_backup_run(&self, backup_id: &str) -> Result<Option<BackupRun>> {
        let client = self.client.lock().await;
        let row = client.get(Get::new(session_row(backup_id))).await?;
        snapshot_of(&row)
    }

    async fn list_backup_runs(&self, state: Option<BackupState>) -> Result<Vec<BackupRun>> {
        let client = self.client.lock().await;
        let index = client.get(Get::new(SESSIONS_ROW).family(FAMILY)).await?;

        let mut runs = Vec::new();
        for (id, run_state) in index.family_cells(FAMILY) {
            if state.is_some_and(|s| s.as_str().as_bytes() != run_state) {
                continue;
            }
            let row = client.get(Get::new(session_row(&utf8(id)?))).await?;
            if let Some(run) = snapshot_of(&row)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn record_wal_files(&self, backup_id: &str, files: &[PathBuf]) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let client = self.client.lock().await;
        let row = wals_row(backup_id);
        let end = client
            .increment_column_value(row.as_bytes(), FAMILY, WAL_COUNT, files.len() as i64)
            .await?;
        let start = end - files.len() as i64;

        let mut put = Put::new(row);
        for (offset, file) in files.iter().enumerate() {
            let qualifier = format!("{WAL_PREFIX}{:010}", start + offset as i64);
            put = put.add_column(FAMILY, qualifier, file.to_string_lossy().as_bytes());
        }
        client.put(put).await
    }

    async fn read_wal_files(&self, backup_id: &str) -> Result<Vec<PathBuf>> {
        let client = self.client.lock().await;
        let row = client.get(Get::new(wals_row(backup_id)).family(FAMILY)).await?;
        row.family_cells(FAMILY)
            .filter(|(qualifier, _)| qualifier.starts_with(WAL_PREFIX.as_bytes()))
            .map(|(_, path)| Ok(PathBuf::from(utf8(path)?)))
            .collect()
    }

    async fn read_log_timestamp_map(&self) -> Result<TimestampMap> {
        let client = self.client.lock().await;
        let index = client.get(Get::new(TIMESTAMP_INDEX_ROW).family(FAMILY)).await?;

        let mut map = TimestampMap::new();
        for (table, _) in index.family_cells(FAMILY) {
            let table: TableName = utf8(table)?.parse()?;
            let row = client.get(Get::new(timestamps_row(&table)).family(FAMILY)).await?;
            let servers = row
                .family_cells(FAMILY)
                .map(|(server, ts)| Ok((utf8(server)?, decode_timestamp(ts)?)))
                .collect::<Result<ServerTimestamps>>()?;
            if !servers.is_empty() {
                map.insert(table, servers);
            }
        }
        Ok(map)
    }

    async fn write_region_server_log_timestamps(
        &self,
        tables: &BTreeSet<TableName>,
        timestamps: &ServerTimestamps,
    ) -> Result<()> {
        let client = self.client.lock().await;
        for table in tables {
            // Index first: an indexed table without cells reads as absent
            client
                .put(Put::new(TIMESTAMP_INDEX_ROW).add_column(FAMILY, table.as_str(), Vec::new()))
                .await?;

            let row = timestamps_row(table);
            let current = client.get(Get::new(row.clone()).family(FAMILY)).await?;

            let mut put = Put::new(row.clone());
            for (server, ts) in timestamps {
                put = put.add_column(FAMILY, server.as_bytes(), ts.to_be_bytes().to_vec());
            }
            if !put.cells.is_empty() {
                client.put(put).await?;
            }

            // Stale servers go only once the new cells are durable
            let mut stale = Delete::new(row);
            for (server, _) in current.family_cells(FAMILY) {
                if !timestamps.contains_key(utf8(server)?.as_str()) {
                    stale = stale.add_column(FAMILY, server);
                }
            }
            if !stale.columns.is_empty() {
                client.delete(stale).await?;
            }
        }
        Ok(())
    }

    async fn read_start_code(&self) -> Result<Option<u64>> {
        let client = self.client.lock().await;
        let row = client.get(Get::new(START_CODE_ROW)).await?;
        row.value(FAMILY, START_CODE_ROW.as_bytes())
            .map(|v| {
                let text = utf8(v)?;
                text.parse::<u64>()
                    .map_err(|_| BackupError::Metadata(format!("invalid start code '{text}' in store")))
            })
            .transpose()
    }

    async fn write_start_code(&self, start_code: u64) -> Result<()> {
        let client = self.client.lock().await;
        client
            .put(Put::new(START_CODE_ROW).add_column(
                FAMILY,
                START_CODE_ROW,
                start_code.to_string(),
            ))
            .await
    }

    async fn describe_backup_set(&self, name: &str) -> Result<Option<Vec<TableName>>> {
        let client = self.client.lock().await;
        let row = client.get(Get::new(set_row(name))).await?;
        match row.value(FAMILY, SET_TABLES) {
            Some(list) => Ok(Some(parse_table_names(Some(&utf8(list)?))?.unwrap_or_default())),
            None => Ok(None),
        }
    }

    async fn add_backup_set(&self, name: &str, tables: &[TableName]) -> Result<()> {
        let client = self.client.lock().await;
        client
            .put(Put::new(set_row(name)).add_column(FAMILY, SET_TABLES, join_table_names(tables)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Append, Increment, MemTable};
    use crate::model::{compute_start_code, BackupRequest, BackupType};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Rejects puts to rows under `prefix` while `failing` is set.
    struct FailingPuts {
        inner: MemTable,
        prefix: &'static str,
        failing: AtomicBool,
    }

    #[async_trait]
    impl DataClient for FailingPuts {
        async fn get(&self, get: Get) -> Result<RowResult> {
            self.inner.get(get).await
        }

        async fn put(&self, put: Put) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) && put.row.starts_with(self.prefix.as_bytes()) {
                return Err(BackupError::Metadata("region unavailable".to_string()));
            }
            self.inner.put(put).await
        }

        async fn delete(&self, delete: Delete) -> Result<()> {
            self.inner.delete(delete).await
        }

        async fn append(&self, append: Append) -> Result<RowResult> {
            self.inner.append(append).await
        }

        async fn increment(&self, increment: Increment) -> Result<RowResult> {
            self.inner.increment(increment).await
        }
    }

    fn run(id: &str) -> BackupRun {
        BackupRun::new(
            id,
            BackupRequest {
                backup_type: BackupType::Incremental,
                tables: vec!["t1".parse().unwrap()],
                target_root_dir: PathBuf::from("/backup"),
                workers: None,
                bandwidth_mb: None,
            },
            1,
            0,
        )
    }

    #[tokio::test]
    async fn test_runs_are_indexed_by_state() -> anyhow::Result<()> {
        let store = TableMetadataStore::new(MemTable::new());
        store.create_backup_run(&run("backup_1")).await?;
        store.create_backup_run(&run("backup_2")).await?;
        assert!(store.create_backup_run(&run("backup_1")).await.is_err());

        let mut done = store.get_backup_run("backup_1").await?.unwrap();
        done.mark_complete();
        store.update_backup_run(&done).await?;

        let running = store.list_backup_runs(Some(BackupState::Running)).await?;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].backup_id, "backup_2");
        assert_eq!(store.list_backup_runs(None).await?.len(), 2);
        assert!(store.update_backup_run(&run("backup_3")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_wal_files_append_in_order() -> anyhow::Result<()> {
        let store = TableMetadataStore::new(MemTable::new());
        let first = vec![PathBuf::from("/logs/WALs/rs1/rs1.1"), PathBuf::from("/logs/WALs/rs1/rs1.2")];
        let second = vec![PathBuf::from("/logs/oldWALs/rs2/rs2.3")];
        store.record_wal_files("backup_1", &first).await?;
        store.record_wal_files("backup_1", &second).await?;

        let all: Vec<PathBuf> = first.into_iter().chain(second).collect();
        assert_eq!(store.read_wal_files("backup_1").await?, all);
        Ok(())
    }

    #[tokio::test]
    async fn test_timestamps_and_start_code() -> anyhow::Result<()> {
        let store = TableMetadataStore::new(MemTable::new());
        let t1: BTreeSet<TableName> = ["t1".parse::<TableName>()?].into();
        let t2: BTreeSet<TableName> = ["t2".parse::<TableName>()?].into();

        store
            .write_region_server_log_timestamps(&t1, &ServerTimestamps::from([("rs1".to_string(), 10)]))
            .await?;
        store
            .write_region_server_log_timestamps(&t2, &ServerTimestamps::from([("rs2".to_string(), 20)]))
            .await?;
        store
            .write_region_server_log_timestamps(&t1, &ServerTimestamps::from([("rs3".to_string(), 30)]))
            .await?;

        let map = store.read_log_timestamp_map().await?;
        assert_eq!(map.len(), 2);
        assert_eq!(map[&"t1".parse::<TableName>()?], ServerTimestamps::from([("rs3".to_string(), 30)]));

        assert_eq!(store.read_start_code().await?, None);
        store.write_start_code(20).await?;
        assert_eq!(store.read_start_code().await?, Some(20));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_timestamp_write_keeps_previous_cells() -> anyhow::Result<()> {
        let table = MemTable::new();
        let t1: BTreeSet<TableName> = ["t1".parse::<TableName>()?].into();
        let t2: BTreeSet<TableName> = ["t2".parse::<TableName>()?].into();
        let seed = TableMetadataStore::new(table.clone());
        seed.write_region_server_log_timestamps(&t1, &ServerTimestamps::from([("rs1".to_string(), 100)]))
            .await?;
        seed.write_region_server_log_timestamps(&t2, &ServerTimestamps::from([("rs1".to_string(), 900)]))
            .await?;

        // Data rows of the timestamp layout reject writes, the index row does not
        let store = TableMetadataStore::new(FailingPuts {
            inner: table,
            prefix: "rslogts:",
            failing: AtomicBool::new(true),
        });
        let result = store
            .write_region_server_log_timestamps(&t1, &ServerTimestamps::from([("rs2".to_string(), 150)]))
            .await;
        assert!(result.is_err());

        let map = store.read_log_timestamp_map().await?;
        assert_eq!(map[&"t1".parse::<TableName>()?], ServerTimestamps::from([("rs1".to_string(), 100)]));
        assert_eq!(compute_start_code(&map), Some(100));

        store.client.lock().await.failing.store(false, Ordering::SeqCst);
        store
            .write_region_server_log_timestamps(&t1, &ServerTimestamps::from([("rs2".to_string(), 150)]))
            .await?;
        let map = store.read_log_timestamp_map().await?;
        assert_eq!(map[&"t1".parse::<TableName>()?], ServerTimestamps::from([("rs2".to_string(), 150)]));
        Ok(())
    }

    #[tokio::test]
    async fn test_backup_set_lookup() -> anyhow::Result<()> {
        let store = TableMetadataStore::new(MemTable::new());
        store.add_backup_set("nightly", &["t1".parse::<TableName>()?, "t2".parse::<TableName>()?]).await?;
        assert_eq!(store.describe_backup_set("nightly").await?.map(|t| t.len()), Some(2));
        assert_eq!(store.describe_backup_set("missing").await?, None);
        Ok(())
    }
}
