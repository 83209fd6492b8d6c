//! Incremental copy of a run's log segments into its image.
//!
//! The storage engine may move a segment from the active to the archived log
//! directory while the copy is running. Such a segment is absent from the
//! destination after the first attempt; the session then retries exactly once
//! with the segments' archived paths. Anything still missing after that is
//! presumed lost and the session fails rather than loop.

use crate::copy::{BackupCopyTask, COPY_SUCCESS};
use crate::fs::LogFileLocator;
use crate::model::{BackupRun, BackupType};
use crate::utils::{BackupError, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Copy invocations per session: the first attempt plus one rotation-aware retry.
pub const MAX_COPY_ATTEMPTS: u32 = 2;

/// Result of a successful session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Every segment now in the image, with rotated segments under their archived path.
    pub files: Vec<PathBuf>,
    /// Number of copy invocations made (0 when nothing was left to copy).
    pub attempts: u32,
}

pub struct IncrementalCopySession {
    task: Arc<dyn BackupCopyTask>,
    locator: LogFileLocator,
}

impl IncrementalCopySession {
    pub fn new(task: Arc<dyn BackupCopyTask>, locator: LogFileLocator) -> Self {
        Self { task, locator }
    }

    /// Copy `file_list` into `run.log_target_dir`.
    ///
    /// Segments that no longer exist at the source are dropped, as are
    /// segments whose copy is already in the image; replaying an interrupted
    /// session therefore only copies what is left.
    pub async fn run(&self, run: &BackupRun, file_list: &[PathBuf]) -> Result<CopyOutcome> {
        let target = run.log_target_dir.as_path();
        info!(backup_id = %run.backup_id, files = file_list.len(), "Incremental copy is starting");

        let mut files = self.locator.existing(file_list).await?;
        let mut to_copy = self.locator.pending(&files, target).await?;

        if to_copy.is_empty() {
            info!(backup_id = %run.backup_id, "Nothing left to copy");
            return Ok(CopyOutcome { files, attempts: 0 });
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut args = Vec::with_capacity(to_copy.len() + 1);
            args.extend(to_copy.iter().cloned());
            args.push(target.to_path_buf());

            let status = self.task.copy(run, BackupType::Incremental, &args).await?;
            if status != COPY_SUCCESS {
                error!(
                    backup_id = %run.backup_id,
                    status,
                    attempt,
                    "Copy incremental log files failed"
                );
                return Err(BackupError::CopyTaskFailure {
                    status,
                    sources: to_copy,
                    target: target.to_path_buf(),
                });
            }

            let missing = self.locator.missing_at_destination(&to_copy, target).await?;
            if missing.is_empty() {
                break;
            }

            if attempt >= MAX_COPY_ATTEMPTS {
                error!(
                    backup_id = %run.backup_id,
                    missing = missing.len(),
                    "Copy could not finish all files after rotation-aware retry"
                );
                return Err(BackupError::IncrementalCopyIncomplete { missing });
            }

            // Segments rotated out of the active directory mid-copy
            let archived = self.locator.to_archived(&missing)?;
            warn!(
                backup_id = %run.backup_id,
                rotated = archived.len(),
                "Retrying copy for segments moved to the archived log directory"
            );
            replace_paths(&mut files, &missing, &archived);
            to_copy = archived;
        }

        info!(
            backup_id = %run.backup_id,
            files = files.len(),
            attempts = attempt,
            target = %target.display(),
            "Incremental copy finished"
        );
        Ok(CopyOutcome {
            files,
            attempts: attempt,
        })
    }
}

/// Swap each `from[i]` in `files` for `to[i]`, keeping positions.
fn replace_paths(files: &mut [PathBuf], from: &[PathBuf], to: &[PathBuf]) {
    let mapping: HashMap<&PathBuf, &PathBuf> = from.iter().zip(to).collect();
    for file in files.iter_mut() {
        if let Some(&replacement) = mapping.get(&*file) {
            *file = replacement.clone();
        }
    }
}
