//! The backup run record and its phase/state enums.
//!
//! A `BackupRun` is created when a backup is requested, mutated in place by
//! the lifecycle manager, and persisted as a JSON snapshot at every phase
//! boundary so a crashed run can be diagnosed afterwards.

use super::{TableName, TimestampMap};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Directory under `<target_root>/<backup_id>/` receiving the copied log segments.
pub const IMAGE_LOG_DIR: &str = "WALs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupType {
    Full,
    Incremental,
}

/// Coarse outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupState {
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl BackupState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BackupState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupState::Running => "RUNNING",
            BackupState::Complete => "COMPLETE",
            BackupState::Failed => "FAILED",
            BackupState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained step within a running backup. Declaration order is phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupPhase {
    Request,
    Prepare,
    IncrementalCopy,
    Bookkeeping,
    Complete,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupPhase::Request => "REQUEST",
            BackupPhase::Prepare => "PREPARE",
            BackupPhase::IncrementalCopy => "INCREMENTAL_COPY",
            BackupPhase::Bookkeeping => "BOOKKEEPING",
            BackupPhase::Complete => "COMPLETE",
        };
        f.write_str(s)
    }
}

/// A request to back up a set of tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,
    pub tables: Vec<TableName>,
    pub target_root_dir: PathBuf,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub bandwidth_mb: Option<u64>,
}

fn default_backup_type() -> BackupType {
    BackupType::Incremental
}

/// Why a run ended in FAILED or CANCELLED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub phase: BackupPhase,
    pub message: String,
    pub cause: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub tables: BTreeSet<TableName>,
    pub target_root_dir: PathBuf,
    pub log_target_dir: PathBuf,
    /// Resource hints for the copy task; opaque to the engine.
    pub workers: usize,
    pub bandwidth_mb: u64,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    /// Per-table timestamps as they were before this run's bookkeeping.
    pub previous_timestamps: Option<TimestampMap>,
    state: BackupState,
    phase: BackupPhase,
    incremental_file_list: Vec<PathBuf>,
    failure: Option<FailureRecord>,
}

/// Backup ids sort by creation time.
pub fn generate_backup_id() -> String {
    format!("backup_{}", Utc::now().timestamp_millis())
}

impl BackupRun {
    pub fn new(backup_id: impl Into<String>, request: BackupRequest, workers: usize, bandwidth_mb: u64) -> Self {
        let backup_id = backup_id.into();
        let log_target_dir = request.target_root_dir.join(&backup_id).join(IMAGE_LOG_DIR);
        Self {
            backup_id,
            backup_type: request.backup_type,
            tables: request.tables.into_iter().collect(),
            target_root_dir: request.target_root_dir,
            log_target_dir,
            workers: request.workers.unwrap_or(workers).max(1),
            bandwidth_mb: request.bandwidth_mb.unwrap_or(bandwidth_mb),
            start_ts: Utc::now(),
            end_ts: None,
            previous_timestamps: None,
            state: BackupState::Running,
            phase: BackupPhase::Request,
            incremental_file_list: Vec::new(),
            failure: None,
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    pub fn phase(&self) -> BackupPhase {
        self.phase
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    pub fn incremental_file_list(&self) -> &[PathBuf] {
        &self.incremental_file_list
    }

    /// Directory of this run's image under the target root.
    pub fn image_dir(&self) -> PathBuf {
        self.target_root_dir.join(&self.backup_id)
    }

    /// Replace the file list, dropping duplicates while keeping first-seen order.
    pub fn set_incremental_file_list(&mut self, files: Vec<PathBuf>) {
        let mut seen = HashSet::with_capacity(files.len());
        self.incremental_file_list = files
            .into_iter()
            .filter(|f| seen.insert(f.clone()))
            .collect();
    }

    pub(crate) fn advance_to(&mut self, phase: BackupPhase) -> Result<()> {
        if self.state != BackupState::Running {
            return Err(BackupError::InvalidState(format!(
                "{} is {}, cannot enter {}",
                self.backup_id, self.state, phase
            )));
        }
        if phase <= self.phase {
            return Err(BackupError::PhaseOrder {
                from: self.phase,
                to: phase,
            });
        }
        self.phase = phase;
        Ok(())
    }

    pub(crate) fn mark_complete(&mut self) {
        self.state = BackupState::Complete;
        self.end_ts = Some(Utc::now());
    }

    pub(crate) fn mark_terminal(&mut self, state: BackupState, message: String, cause: String) {
        self.failure = Some(FailureRecord {
            phase: self.phase,
            message,
            cause,
        });
        self.state = state;
        self.end_ts = Some(Utc::now());
    }

    /// Whether this run was written under `root`. Paths are compared as
    /// given first, then in canonical form so relative and symlinked
    /// spellings of an existing root match.
    pub fn is_under(&self, root: &Path) -> bool {
        if self.target_root_dir == root {
            return true;
        }
        match (self.target_root_dir.canonicalize(), root.canonicalize()) {
            (Ok(ours), Ok(theirs)) => ours == theirs,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BackupRequest {
        BackupRequest {
            backup_type: BackupType::Incremental,
            tables: vec!["t1".parse().unwrap(), "t2".parse().unwrap()],
            target_root_dir: PathBuf::from("/backup"),
            workers: None,
            bandwidth_mb: Some(50),
        }
    }

    #[test]
    fn test_new_run_layout() {
        let run = BackupRun::new("backup_1", request(), 4, 0);
        assert_eq!(run.state(), BackupState::Running);
        assert_eq!(run.phase(), BackupPhase::Request);
        assert_eq!(run.log_target_dir, PathBuf::from("/backup/backup_1/WALs"));
        assert_eq!(run.workers, 4);
        assert_eq!(run.bandwidth_mb, 50);
        assert!(run.is_under(Path::new("/backup")));
    }

    #[test]
    fn test_is_under_matches_equivalent_roots() -> anyhow::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let root = temp_dir.path().join("backup");
        std::fs::create_dir_all(root.join("sub"))?;

        let mut req = request();
        req.target_root_dir = root.clone();
        let run = BackupRun::new("backup_1", req, 1, 0);

        assert!(run.is_under(&root.join("sub/..")));
        assert!(!run.is_under(&root.join("sub")));
        assert!(!run.is_under(&temp_dir.path().join("missing")));

        #[cfg(unix)]
        {
            let link = temp_dir.path().join("link");
            std::os::unix::fs::symlink(&root, &link)?;
            assert!(run.is_under(&link));
        }
        Ok(())
    }

    #[test]
    fn test_phase_is_monotonic() {
        let mut run = BackupRun::new("backup_1", request(), 1, 0);
        run.advance_to(BackupPhase::Prepare).unwrap();
        run.advance_to(BackupPhase::IncrementalCopy).unwrap();

        let err = run.advance_to(BackupPhase::Prepare).unwrap_err();
        assert!(matches!(
            err,
            BackupError::PhaseOrder {
                from: BackupPhase::IncrementalCopy,
                to: BackupPhase::Prepare
            }
        ));
        assert!(run.advance_to(BackupPhase::IncrementalCopy).is_err());
    }

    #[test]
    fn test_terminal_run_cannot_advance() {
        let mut run = BackupRun::new("backup_1", request(), 1, 0);
        run.mark_terminal(BackupState::Failed, "boom".into(), "io".into());
        assert!(matches!(
            run.advance_to(BackupPhase::Prepare),
            Err(BackupError::InvalidState(_))
        ));
        assert_eq!(run.failure().unwrap().phase, BackupPhase::Request);
    }

    #[test]
    fn test_file_list_is_deduplicated() {
        let mut run = BackupRun::new("backup_1", request(), 1, 0);
        run.set_incremental_file_list(vec![
            PathBuf::from("/a"),
            PathBuf::from("/b"),
            PathBuf::from("/a"),
        ]);
        assert_eq!(
            run.incremental_file_list(),
            &[PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn test_snapshot_round_trip_keeps_state() {
        let mut run = BackupRun::new("backup_1", request(), 1, 0);
        run.advance_to(BackupPhase::Prepare).unwrap();
        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains("\"PREPARE\""));
        let back: BackupRun = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phase(), BackupPhase::Prepare);
        assert_eq!(back.tables, run.tables);
    }
}
