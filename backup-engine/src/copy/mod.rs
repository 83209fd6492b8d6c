//! Pluggable bulk-copy backends.
//!
//! A backend copies a list of source files into a destination directory in a
//! single invocation. The argument list carries the destination as its final
//! element. Failure is binary: status `0` is success, anything else is a
//! failure reported by the copy job itself; transport faults are `Err`.

pub mod command;
pub mod job_tracker;
pub mod local;
pub mod registry;

pub use command::CommandCopyTask;
pub use job_tracker::JobTracker;
pub use local::LocalCopyTask;
pub use registry::{CopyTaskConstructor, CopyTaskRegistry};

use crate::model::{BackupRun, BackupType};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Status returned by a successful copy invocation.
pub const COPY_SUCCESS: i32 = 0;

#[async_trait]
pub trait BackupCopyTask: Send + Sync {
    /// Copy `args[..len-1]` into the directory `args[len-1]`.
    async fn copy(&self, run: &BackupRun, backup_type: BackupType, args: &[PathBuf]) -> Result<i32>;

    /// Request cancellation of the job registered under `job_handle`.
    ///
    /// Returns once the request is issued, not once the job has stopped.
    async fn cancel(&self, job_handle: &str) -> Result<()>;
}

/// The handle a run's copy job is registered under.
pub fn job_handle(run: &BackupRun) -> &str {
    &run.backup_id
}

/// Split a copy argument list into its sources and destination marker.
pub fn split_copy_args(args: &[PathBuf]) -> Result<(&[PathBuf], &Path)> {
    match args.split_last() {
        Some((target, sources)) => Ok((sources, target.as_path())),
        None => Err(BackupError::Validation(
            "copy arguments must end with a destination".to_string(),
        )),
    }
}
