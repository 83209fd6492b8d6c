//! Copy backend delegating to an external program (a distributed copy job
//! launcher, `rsync`, a cloud transfer CLI, ...).
//!
//! The program is invoked as `<command> <args...> <sources...> <target>` and
//! its exit code is the copy status.

use super::{split_copy_args, BackupCopyTask, JobTracker};
use crate::model::{BackupRun, BackupType};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// Status reported when the program was terminated by a signal.
pub const STATUS_KILLED: i32 = -1;

#[derive(Clone)]
pub struct CommandCopyTask {
    program: String,
    args: Vec<String>,
    tracker: JobTracker,
}

impl CommandCopyTask {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            tracker: JobTracker::new(),
        }
    }
}

#[async_trait]
impl BackupCopyTask for CommandCopyTask {
    async fn copy(&self, run: &BackupRun, backup_type: BackupType, args: &[PathBuf]) -> Result<i32> {
        let (sources, target) = split_copy_args(args)?;
        tokio::fs::create_dir_all(target).await?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(sources)
            .arg(target)
            .env("BACKUP_ID", &run.backup_id)
            .env("BACKUP_TYPE", format!("{backup_type:?}").to_uppercase())
            .env("BACKUP_WORKERS", run.workers.to_string())
            .env("BACKUP_BANDWIDTH_MB", run.bandwidth_mb.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        info!(
            backup_id = %run.backup_id,
            program = %self.program,
            files = sources.len(),
            "Launching copy command"
        );

        let mut child = command.spawn()?;
        let cancel = self.tracker.register(super::job_handle(run)).await;

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                warn!(backup_id = %run.backup_id, "Killing copy command");
                child.start_kill()?;
                let _ = child.wait().await;
                self.tracker.complete(super::job_handle(run)).await;
                return Err(BackupError::Cancelled);
            }
        };
        self.tracker.complete(super::job_handle(run)).await;

        let status = status?;
        let code = status.code().unwrap_or(STATUS_KILLED);
        info!(backup_id = %run.backup_id, code, "Copy command exited");
        Ok(code)
    }

    async fn cancel(&self, job_handle: &str) -> Result<()> {
        if !self.tracker.cancel(job_handle).await {
            warn!(job_handle, "No running copy command to cancel");
        }
        Ok(())
    }
}
