use super::connection::DbPool;
use crate::utils::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_runs (
  backup_id TEXT PRIMARY KEY,
  state TEXT NOT NULL CHECK(state IN ('RUNNING','COMPLETE','FAILED','CANCELLED')),
  phase TEXT NOT NULL,
  target_root_dir TEXT NOT NULL,
  snapshot TEXT NOT NULL,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS wal_files (
  backup_id TEXT NOT NULL REFERENCES backup_runs(backup_id) ON DELETE CASCADE,
  seq INTEGER NOT NULL,
  path TEXT NOT NULL,
  PRIMARY KEY (backup_id, path)
);

CREATE TABLE IF NOT EXISTS log_timestamps (
  table_name TEXT NOT NULL,
  server TEXT NOT NULL,
  ts INTEGER NOT NULL,
  PRIMARY KEY (table_name, server)
);

CREATE TABLE IF NOT EXISTS backup_sets (
  name TEXT PRIMARY KEY,
  tables TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backup_runs_state ON backup_runs(state);
CREATE INDEX IF NOT EXISTS idx_wal_files_seq ON wal_files(backup_id, seq);
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::info!("[DB] Starting metadata migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

