//! Computing the incremental log file list of a backup run.
//!
//! Segments live at `<wal_root>/<dir>/<server>/<segment>` where `<dir>` is the
//! active or archived log directory and the segment name ends in
//! `.<timestamp>`.

use super::LogDirLayout;
use crate::model::{BackupRun, ServerTimestamps, TimestampMap};
use crate::Result;
use async_trait::async_trait;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Log segments to copy and the per-server timestamps they advance to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalLogList {
    pub files: Vec<PathBuf>,
    pub new_timestamps: ServerTimestamps,
}

#[async_trait]
pub trait IncrementalLogLister: Send + Sync {
    /// Segments written since `previous` for the run's tables.
    async fn list(&self, run: &BackupRun, previous: &TimestampMap) -> Result<IncrementalLogList>;
}

/// Lists segments by walking the active and archived log directories.
#[derive(Debug, Clone)]
pub struct WalDirectoryLister {
    wal_root: PathBuf,
    layout: LogDirLayout,
}

#[derive(Debug, Clone)]
struct Segment {
    path: PathBuf,
    server: String,
    timestamp: u64,
}

impl WalDirectoryLister {
    pub fn new(wal_root: impl Into<PathBuf>, layout: LogDirLayout) -> Self {
        Self {
            wal_root: wal_root.into(),
            layout,
        }
    }
}

#[async_trait]
impl IncrementalLogLister for WalDirectoryLister {
    async fn list(&self, run: &BackupRun, previous: &TimestampMap) -> Result<IncrementalLogList> {
        let since = previous_for_tables(run, previous);
        let dirs = [
            self.layout.active_dir(&self.wal_root),
            self.layout.archived_dir(&self.wal_root),
        ];

        // Use blocking task for the directory walk
        let segments = tokio::task::spawn_blocking(move || {
            let mut by_name: HashMap<OsString, Segment> = HashMap::new();
            for dir in &dirs {
                for segment in scan_log_dir(dir)? {
                    let Some(name) = segment.path.file_name().map(OsString::from) else {
                        continue;
                    };
                    // Active directory is scanned first and wins
                    if let Entry::Vacant(slot) = by_name.entry(name) {
                        slot.insert(segment);
                    }
                }
            }
            Ok::<_, std::io::Error>(by_name.into_values().collect::<Vec<_>>())
        })
        .await??;

        let list = select_segments(segments, &since);
        info!(
            backup_id = %run.backup_id,
            files = list.files.len(),
            servers = list.new_timestamps.len(),
            "Computed incremental log list"
        );
        Ok(list)
    }
}

/// Per server, the oldest timestamp recorded for any of the run's tables.
fn previous_for_tables(run: &BackupRun, previous: &TimestampMap) -> ServerTimestamps {
    let mut since = ServerTimestamps::new();
    for servers in run.tables.iter().filter_map(|t| previous.get(t)) {
        for (server, &ts) in servers {
            since
                .entry(server.clone())
                .and_modify(|cur| *cur = (*cur).min(ts))
                .or_insert(ts);
        }
    }
    since
}

fn select_segments(segments: Vec<Segment>, since: &ServerTimestamps) -> IncrementalLogList {
    let mut selected: Vec<Segment> = segments
        .into_iter()
        .filter(|s| since.get(&s.server).map_or(true, |&prev| s.timestamp > prev))
        .collect();
    selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path)));

    let mut new_timestamps = since.clone();
    for s in &selected {
        new_timestamps
            .entry(s.server.clone())
            .and_modify(|cur| *cur = (*cur).max(s.timestamp))
            .or_insert(s.timestamp);
    }

    IncrementalLogList {
        files: selected.into_iter().map(|s| s.path).collect(),
        new_timestamps,
    }
}

/// Timestamp suffix of a segment name; `None` for names without one (e.g. `.meta`).
pub fn segment_timestamp(name: &str) -> Option<u64> {
    name.rsplit_once('.').and_then(|(_, ts)| ts.parse().ok())
}

fn scan_log_dir(dir: &Path) -> std::io::Result<Vec<Segment>> {
    if !dir.is_dir() {
        debug!("Log directory does not exist: {}", dir.display());
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for entry in WalkDir::new(dir).min_depth(2).max_depth(2) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        let Some(timestamp) = segment_timestamp(&name) else {
            debug!("Skipping non-segment file: {}", entry.path().display());
            continue;
        };
        let server = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        segments.push(Segment {
            path: entry.path().to_path_buf(),
            server,
            timestamp,
        });
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackupRequest, BackupType, TableName};
    use std::fs;
    use tempfile::TempDir;

    fn run(tables: &[&str]) -> BackupRun {
        BackupRun::new(
            "backup_1",
            BackupRequest {
                backup_type: BackupType::Incremental,
                tables: tables.iter().map(|t| t.parse().unwrap()).collect(),
                target_root_dir: PathBuf::from("/backup"),
                workers: None,
                bandwidth_mb: None,
            },
            1,
            0,
        )
    }

    fn touch(root: &Path, rel: &str) -> std::io::Result<()> {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(path, b"wal")
    }

    #[test]
    fn test_segment_timestamp() {
        assert_eq!(segment_timestamp("rs1%2C16020%2C1.1700000000000"), Some(1_700_000_000_000));
        assert_eq!(segment_timestamp("rs1%2C16020%2C1.1700.meta"), None);
        assert_eq!(segment_timestamp("noext"), None);
    }

    #[tokio::test]
    async fn test_lists_segments_newer_than_previous() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        touch(root, "WALs/rs1/rs1.100")?;
        touch(root, "WALs/rs1/rs1.300")?;
        touch(root, "WALs/rs2/rs2.50")?;
        touch(root, "oldWALs/rs1/rs1.200")?;
        touch(root, "WALs/rs1/rs1.300.meta")?;

        let mut previous = TimestampMap::new();
        let t1: TableName = "t1".parse()?;
        previous.insert(t1, ServerTimestamps::from([("rs1".to_string(), 150)]));

        let lister = WalDirectoryLister::new(root, LogDirLayout::default());
        let list = lister.list(&run(&["t1"]), &previous).await?;

        assert_eq!(
            list.files,
            vec![
                root.join("WALs/rs2/rs2.50"),
                root.join("oldWALs/rs1/rs1.200"),
                root.join("WALs/rs1/rs1.300"),
            ]
        );
        assert_eq!(list.new_timestamps.get("rs1"), Some(&300));
        assert_eq!(list.new_timestamps.get("rs2"), Some(&50));
        Ok(())
    }

    #[tokio::test]
    async fn test_active_copy_wins_over_archived() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        touch(root, "WALs/rs1/rs1.100")?;
        touch(root, "oldWALs/rs1/rs1.100")?;

        let lister = WalDirectoryLister::new(root, LogDirLayout::default());
        let list = lister.list(&run(&["t1"]), &TimestampMap::new()).await?;
        assert_eq!(list.files, vec![root.join("WALs/rs1/rs1.100")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_log_dirs_yield_empty_list() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let mut previous = TimestampMap::new();
        previous.insert("t1".parse()?, ServerTimestamps::from([("rs1".to_string(), 10)]));

        let lister = WalDirectoryLister::new(temp_dir.path(), LogDirLayout::default());
        let list = lister.list(&run(&["t1"]), &previous).await?;
        assert!(list.files.is_empty());
        assert_eq!(list.new_timestamps.get("rs1"), Some(&10));
        Ok(())
    }
}
