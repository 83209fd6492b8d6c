//! Copy backend for sources and destinations on the local filesystem.

use super::{split_copy_args, BackupCopyTask, JobTracker, COPY_SUCCESS};
use crate::fs::LogFileLocator;
use crate::model::{BackupRun, BackupType};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Status reported when at least one file failed to copy.
pub const COPY_FAILED: i32 = 1;

const BYTES_PER_MB: u64 = 1024 * 1024;

const COPY_CHUNK: usize = 1024 * 1024;

/// Suffix of a destination while it is being written.
const PARTIAL_SUFFIX: &str = ".copying";

/// Copies files with `tokio::fs`, `run.workers` at a time.
#[derive(Clone, Default)]
pub struct LocalCopyTask {
    tracker: JobTracker,
}

impl LocalCopyTask {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BackupCopyTask for LocalCopyTask {
    async fn copy(&self, run: &BackupRun, backup_type: BackupType, args: &[PathBuf]) -> Result<i32> {
        let (sources, target) = split_copy_args(args)?;
        tokio::fs::create_dir_all(target).await?;

        info!(
            backup_id = %run.backup_id,
            ?backup_type,
            files = sources.len(),
            workers = run.workers,
            target = %target.display(),
            "Starting local copy"
        );

        let planned = sources
            .iter()
            .map(|s| Ok((s.clone(), LogFileLocator::destination_of(s, target)?)))
            .collect::<Result<Vec<_>>>()?;

        let cancel = self.tracker.register(super::job_handle(run)).await;
        let semaphore = Arc::new(Semaphore::new(run.workers.max(1)));
        let throttle = Arc::new(Throttle::new(run.bandwidth_mb));
        let failures = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(planned.len());
        for (source, dest) in planned {
            let sem = Arc::clone(&semaphore);
            let throttle = Arc::clone(&throttle);
            let failures = Arc::clone(&failures);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = sem.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return,
                    },
                    _ = cancel.cancelled() => return,
                };

                match copy_file(&source, &dest, &cancel).await {
                    Ok(FileCopy::Copied(bytes)) => throttle.record(bytes, &cancel).await,
                    Ok(FileCopy::Vanished) => warn!("Source vanished before copy: {}", source.display()),
                    Ok(FileCopy::Cancelled) => {}
                    Err(e) => {
                        error!("Failed to copy {} to {}: {}", source.display(), dest.display(), e);
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Copy task panicked: {}", e);
                failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let was_cancelled = cancel.is_cancelled();
        self.tracker.complete(super::job_handle(run)).await;

        if was_cancelled {
            info!(backup_id = %run.backup_id, "Local copy cancelled");
            return Err(BackupError::Cancelled);
        }

        let failed = failures.load(Ordering::Relaxed);
        if failed > 0 {
            error!(backup_id = %run.backup_id, failed, "Local copy finished with failures");
            Ok(COPY_FAILED)
        } else {
            Ok(COPY_SUCCESS)
        }
    }

    async fn cancel(&self, job_handle: &str) -> Result<()> {
        if !self.tracker.cancel(job_handle).await {
            warn!(job_handle, "No running copy job to cancel");
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FileCopy {
    Copied(u64),
    /// The source no longer exists.
    Vanished,
    Cancelled,
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut partial = dest.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    PathBuf::from(partial)
}

/// Copy through a temporary name so the destination only appears once complete.
/// The temporary file is removed on failure and on cancellation.
async fn copy_file(source: &Path, dest: &Path, cancel: &CancellationToken) -> std::io::Result<FileCopy> {
    let reader = match File::open(source).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileCopy::Vanished),
        Err(e) => return Err(e),
    };

    let partial = partial_path(dest);
    match copy_chunks(reader, &partial, cancel).await {
        Ok(Some(bytes)) => {
            tokio::fs::rename(&partial, dest).await?;
            Ok(FileCopy::Copied(bytes))
        }
        Ok(None) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Ok(FileCopy::Cancelled)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(e)
        }
    }
}

/// Returns `None` when cancelled between chunks.
async fn copy_chunks(mut reader: File, partial: &Path, cancel: &CancellationToken) -> std::io::Result<Option<u64>> {
    let mut writer = File::create(partial).await?;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    writer.flush().await?;
    writer.sync_all().await?;
    Ok(Some(total))
}

/// Paces copies so the aggregate rate stays under the bandwidth cap.
struct Throttle {
    bytes_per_sec: u64,
    started: Instant,
    copied: AtomicU64,
}

impl Throttle {
    fn new(bandwidth_mb: u64) -> Self {
        Self {
            bytes_per_sec: bandwidth_mb.saturating_mul(BYTES_PER_MB),
            started: Instant::now(),
            copied: AtomicU64::new(0),
        }
    }

    async fn record(&self, bytes: u64, cancel: &CancellationToken) {
        if self.bytes_per_sec == 0 {
            return;
        }
        let total = self.copied.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let due = Duration::from_secs_f64(total as f64 / self.bytes_per_sec as f64);
        if let Some(wait) = due.checked_sub(self.started.elapsed()) {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}
