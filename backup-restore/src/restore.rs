//! Restoring tables from an incremental backup image.
//!
//! Restore validates that the image can serve the requested tables and then
//! stages the image's log segments under
//! `<backup_root>/<backup_id>/restore/<target_table>/`, where the storage
//! engine's replay tooling picks them up.

use async_trait::async_trait;
use backup_engine::copy::{BackupCopyTask, COPY_SUCCESS};
use backup_engine::fs::LogFileLocator;
use backup_engine::metadata::MetadataStore;
use backup_engine::model::{BackupRun, BackupState, TableName, IMAGE_LOG_DIR};
use backup_engine::{BackupError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Directory under an image receiving staged restores.
pub const RESTORE_DIR: &str = "restore";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub backup_root_dir: PathBuf,
    pub backup_id: String,
    /// Tables as named in the backup.
    pub tables: Vec<TableName>,
    /// Restore destinations, positionally matched to `tables`.
    pub target_tables: Vec<TableName>,
    pub overwrite: bool,
    /// Only validate the image.
    pub check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedTable {
    pub source: TableName,
    pub target: TableName,
    pub dir: PathBuf,
    pub files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup_id: String,
    pub checked_only: bool,
    pub staged: Vec<StagedTable>,
}

#[async_trait]
pub trait RestoreAdmin: Send + Sync {
    async fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport>;
}

pub struct ImageRestoreAdmin {
    store: Arc<dyn MetadataStore>,
    copy_task: Arc<dyn BackupCopyTask>,
}

impl ImageRestoreAdmin {
    pub fn new(store: Arc<dyn MetadataStore>, copy_task: Arc<dyn BackupCopyTask>) -> Self {
        Self { store, copy_task }
    }

    /// Load the run and check it can serve `request`. Returns the run and the
    /// image paths of its log segments.
    async fn validate(&self, request: &RestoreRequest) -> Result<(BackupRun, Vec<PathBuf>)> {
        let id = &request.backup_id;
        let run = self
            .store
            .get_backup_run(id)
            .await?
            .ok_or_else(|| BackupError::Validation(format!("backup {id} does not exist")))?;

        if run.state() != BackupState::Complete {
            return Err(BackupError::Validation(format!(
                "backup {id} is {} and cannot be restored",
                run.state()
            )));
        }
        if !run.is_under(&request.backup_root_dir) {
            return Err(BackupError::Validation(format!(
                "backup {id} was not written under {}",
                request.backup_root_dir.display()
            )));
        }
        if let Some(table) = request.tables.iter().find(|t| !run.tables.contains(*t)) {
            return Err(BackupError::Validation(format!(
                "table {table} is not part of backup {id}"
            )));
        }

        let image_dir = request.backup_root_dir.join(id).join(IMAGE_LOG_DIR);
        if !tokio::fs::try_exists(&image_dir).await? {
            return Err(BackupError::Validation(format!(
                "image directory {} is missing",
                image_dir.display()
            )));
        }

        let mut segments = Vec::new();
        for file in self.store.read_wal_files(id).await? {
            let segment = LogFileLocator::destination_of(&file, &image_dir)?;
            if !tokio::fs::try_exists(&segment).await? {
                return Err(BackupError::Validation(format!(
                    "image segment {} is missing",
                    segment.display()
                )));
            }
            segments.push(segment);
        }

        debug!(backup_id = %id, segments = segments.len(), "Backup image validated");
        Ok((run, segments))
    }

    async fn stage(
        &self,
        run: &BackupRun,
        segments: &[PathBuf],
        staging: &Path,
        overwrite: bool,
    ) -> Result<()> {
        if tokio::fs::try_exists(staging).await? {
            if !overwrite {
                return Err(BackupError::Validation(format!(
                    "{} already exists, use overwrite to replace it",
                    staging.display()
                )));
            }
            tokio::fs::remove_dir_all(staging).await?;
        }
        tokio::fs::create_dir_all(staging).await?;

        if segments.is_empty() {
            return Ok(());
        }

        let mut args = segments.to_vec();
        args.push(staging.to_path_buf());
        let status = self.copy_task.copy(run, run.backup_type, &args).await?;
        if status != COPY_SUCCESS {
            return Err(BackupError::CopyTaskFailure {
                status,
                sources: segments.to_vec(),
                target: staging.to_path_buf(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RestoreAdmin for ImageRestoreAdmin {
    async fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        if request.tables.len() != request.target_tables.len() {
            return Err(BackupError::Validation(format!(
                "{} source tables but {} target tables",
                request.tables.len(),
                request.target_tables.len()
            )));
        }

        let (run, segments) = self.validate(request).await?;
        let mut report = RestoreReport {
            backup_id: run.backup_id.clone(),
            checked_only: request.check,
            staged: Vec::new(),
        };

        if request.check {
            info!(backup_id = %run.backup_id, "Dependency check passed");
            return Ok(report);
        }

        let restore_root = request
            .backup_root_dir
            .join(&request.backup_id)
            .join(RESTORE_DIR);
        for (source, target) in request.tables.iter().zip(&request.target_tables) {
            let staging = restore_root.join(target.as_str());
            self.stage(&run, &segments, &staging, request.overwrite).await?;
            info!(
                backup_id = %run.backup_id,
                source = %source,
                target = %target,
                files = segments.len(),
                "Staged table restore"
            );
            report.staged.push(StagedTable {
                source: source.clone(),
                target: target.clone(),
                dir: staging,
                files: segments.len(),
            });
        }
        Ok(report)
    }
}
