//! Phase sequencing for one incremental backup run.
//!
//! REQUEST → PREPARE → INCREMENTAL_COPY → BOOKKEEPING → COMPLETE. Every
//! transition is persisted. Any error ends the run in exactly one terminal
//! snapshot (FAILED, or CANCELLED for an operator cancellation) and is then
//! returned to the caller.

use crate::bookkeeping;
use crate::copy::{job_handle, BackupCopyTask};
use crate::fs::{IncrementalLogList, IncrementalLogLister, LogFileLocator};
use crate::metadata::MetadataStore;
use crate::model::{BackupPhase, BackupRun, BackupState, BackupType};
use crate::session::IncrementalCopySession;
use crate::utils::{BackupError, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators of a run, resolved once when the run starts.
#[derive(Clone)]
pub struct RunContext {
    pub store: Arc<dyn MetadataStore>,
    pub copy_task: Arc<dyn BackupCopyTask>,
    pub lister: Arc<dyn IncrementalLogLister>,
    pub locator: LogFileLocator,
}

pub struct BackupLifecycleManager {
    run: BackupRun,
    ctx: RunContext,
    persisted: bool,
    resumed: bool,
    bookkeeping_done: bool,
}

impl BackupLifecycleManager {
    /// Manager for a freshly requested run.
    pub fn new(run: BackupRun, ctx: RunContext) -> Self {
        Self {
            run,
            ctx,
            persisted: false,
            resumed: false,
            bookkeeping_done: false,
        }
    }

    /// Rehydrate around a persisted snapshot. A resumed run can be inspected
    /// or abandoned but never executed again.
    pub fn resume(snapshot: BackupRun, ctx: RunContext) -> Self {
        Self {
            run: snapshot,
            ctx,
            persisted: true,
            resumed: true,
            bookkeeping_done: false,
        }
    }

    pub fn run(&self) -> &BackupRun {
        &self.run
    }

    pub fn into_run(self) -> BackupRun {
        self.run
    }

    async fn persist(&mut self) -> Result<()> {
        if self.persisted {
            self.ctx.store.update_backup_run(&self.run).await
        } else {
            self.ctx.store.create_backup_run(&self.run).await?;
            self.persisted = true;
            Ok(())
        }
    }

    /// Validate the request and enter PREPARE.
    pub async fn begin(&mut self) -> Result<()> {
        if self.resumed || self.run.phase() != BackupPhase::Request {
            return Err(BackupError::InvalidState(format!(
                "{} has already been started",
                self.run.backup_id
            )));
        }
        if self.run.tables.is_empty() {
            return Err(BackupError::Validation("no tables to back up".to_string()));
        }
        if self.run.backup_type == BackupType::Full {
            return Err(BackupError::Validation(
                "full backups are not handled by the incremental engine".to_string(),
            ));
        }

        self.run.advance_to(BackupPhase::Prepare)?;
        self.persist().await?;
        info!(
            backup_id = %self.run.backup_id,
            tables = self.run.tables.len(),
            target = %self.run.target_root_dir.display(),
            "Backup run started"
        );
        Ok(())
    }

    /// Move to `phase`, which must come after the current one.
    pub async fn advance(&mut self, phase: BackupPhase) -> Result<()> {
        self.run.advance_to(phase)?;
        debug!(backup_id = %self.run.backup_id, %phase, "Entering phase");
        self.persist().await
    }

    /// Record `cause` and end the run. Calling it on a terminal run has no
    /// effect; a failure to persist is logged, never returned.
    pub async fn fail(&mut self, cause: &BackupError, message: impl Into<String>) {
        let state = match cause {
            BackupError::Cancelled => BackupState::Cancelled,
            _ => BackupState::Failed,
        };
        self.terminate(state, message.into(), cause.to_string()).await;
    }

    async fn terminate(&mut self, state: BackupState, message: String, cause: String) {
        if self.run.state().is_terminal() {
            debug!(backup_id = %self.run.backup_id, state = %self.run.state(), "Run already terminal");
            return;
        }

        error!(
            backup_id = %self.run.backup_id,
            phase = %self.run.phase(),
            %state,
            cause = %cause,
            "{}", message
        );
        self.run.mark_terminal(state, message, cause);

        if let Err(e) = self.persist().await {
            error!(backup_id = %self.run.backup_id, "Failed to persist terminal snapshot: {}", e);
        }
    }

    /// Enter COMPLETE. Only valid once bookkeeping has been written.
    pub async fn complete(&mut self) -> Result<()> {
        if !self.bookkeeping_done {
            return Err(BackupError::InvalidState(format!(
                "{} cannot complete before bookkeeping",
                self.run.backup_id
            )));
        }
        // Commit in memory only once the COMPLETE snapshot is durable
        let mut completed = self.run.clone();
        completed.advance_to(BackupPhase::Complete)?;
        completed.mark_complete();
        self.ctx.store.update_backup_run(&completed).await?;
        self.run = completed;
        info!(
            backup_id = %self.run.backup_id,
            files = self.run.incremental_file_list().len(),
            "Backup run completed"
        );
        Ok(())
    }

    /// Fail a RUNNING snapshot left behind by an interrupted process.
    pub async fn abandon(&mut self) -> Result<()> {
        if self.run.state().is_terminal() {
            return Err(BackupError::InvalidState(format!(
                "{} is already {}",
                self.run.backup_id,
                self.run.state()
            )));
        }
        warn!(backup_id = %self.run.backup_id, phase = %self.run.phase(), "Abandoning interrupted run");
        self.terminate(
            BackupState::Failed,
            "Backup was interrupted before completion".to_string(),
            "interrupted".to_string(),
        )
        .await;
        Ok(())
    }

    /// Drive the run to a terminal state.
    ///
    /// Cancellation is observed during PREPARE and INCREMENTAL_COPY; once
    /// bookkeeping has started the run finishes regardless.
    pub async fn execute(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.resumed || self.run.state().is_terminal() {
            return Err(BackupError::InvalidState(format!(
                "{} cannot be executed again",
                self.run.backup_id
            )));
        }

        match self.drive(&cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = format!("Unexpected exception in {} phase of {}", self.run.phase(), self.run.backup_id);
                self.fail(&e, message).await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.begin().await?;

        let listing = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            listing = self.prepare() => listing?,
        };

        self.advance(BackupPhase::IncrementalCopy).await?;
        let session = IncrementalCopySession::new(self.ctx.copy_task.clone(), self.ctx.locator.clone());
        let copied = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = session.run(&self.run, &listing.files) => Some(outcome),
        };
        let outcome = match copied {
            Some(outcome) => outcome?,
            None => {
                self.cancel_copy().await;
                return Err(BackupError::Cancelled);
            }
        };

        self.run.set_incremental_file_list(outcome.files);
        self.ctx
            .store
            .record_wal_files(&self.run.backup_id, self.run.incremental_file_list())
            .await?;

        self.advance(BackupPhase::Bookkeeping).await?;
        let recorded =
            bookkeeping::record_run(self.ctx.store.as_ref(), &self.run, &listing.new_timestamps).await?;
        self.run.previous_timestamps = Some(recorded.previous);
        self.bookkeeping_done = true;

        self.complete().await
    }

    async fn prepare(&mut self) -> Result<IncrementalLogList> {
        let previous = self.ctx.store.read_log_timestamp_map().await?;
        let listing = self.ctx.lister.list(&self.run, &previous).await?;
        info!(
            backup_id = %self.run.backup_id,
            files = listing.files.len(),
            "Incremental log list computed"
        );
        self.run.set_incremental_file_list(listing.files.clone());
        Ok(listing)
    }

    async fn cancel_copy(&self) {
        let handle = job_handle(&self.run);
        info!(backup_id = %self.run.backup_id, "Cancelling copy job");
        if let Err(e) = self.ctx.copy_task.cancel(handle).await {
            warn!(backup_id = %self.run.backup_id, "Copy job cancel request failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemTable;
    use crate::fs::{LogDirLayout, MemoryFileSystem};
    use crate::metadata::TableMetadataStore;
    use crate::model::{BackupRequest, ServerTimestamps, TableName, TimestampMap};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    struct FixedLister {
        files: Vec<PathBuf>,
        timestamps: ServerTimestamps,
    }

    #[async_trait]
    impl IncrementalLogLister for FixedLister {
        async fn list(&self, _run: &BackupRun, _previous: &TimestampMap) -> Result<IncrementalLogList> {
            Ok(IncrementalLogList {
                files: self.files.clone(),
                new_timestamps: self.timestamps.clone(),
            })
        }
    }

    /// Never finishes listing.
    struct StalledLister;

    #[async_trait]
    impl IncrementalLogLister for StalledLister {
        async fn list(&self, _run: &BackupRun, _previous: &TimestampMap) -> Result<IncrementalLogList> {
            std::future::pending().await
        }
    }

    /// Rejects the COMPLETE snapshot, passes everything else through.
    struct RejectCompleteStore(Arc<TableMetadataStore<MemTable>>);

    #[async_trait]
    impl MetadataStore for RejectCompleteStore {
        async fn create_backup_run(&self, run: &BackupRun) -> Result<()> {
            self.0.create_backup_run(run).await
        }
        async fn update_backup_run(&self, run: &BackupRun) -> Result<()> {
            if run.state() == BackupState::Complete {
                return Err(BackupError::Metadata("disk full".to_string()));
            }
            self.0.update_backup_run(run).await
        }
        async fn get_backup_run(&self, backup_id: &str) -> Result<Option<BackupRun>> {
            self.0.get_backup_run(backup_id).await
        }
        async fn list_backup_runs(&self, state: Option<BackupState>) -> Result<Vec<BackupRun>> {
            self.0.list_backup_runs(state).await
        }
        async fn record_wal_files(&self, backup_id: &str, files: &[PathBuf]) -> Result<()> {
            self.0.record_wal_files(backup_id, files).await
        }
        async fn read_wal_files(&self, backup_id: &str) -> Result<Vec<PathBuf>> {
            self.0.read_wal_files(backup_id).await
        }
        async fn read_log_timestamp_map(&self) -> Result<TimestampMap> {
            self.0.read_log_timestamp_map().await
        }
        async fn write_region_server_log_timestamps(
            &self,
            tables: &BTreeSet<TableName>,
            timestamps: &ServerTimestamps,
        ) -> Result<()> {
            self.0.write_region_server_log_timestamps(tables, timestamps).await
        }
        async fn read_start_code(&self) -> Result<Option<u64>> {
            self.0.read_start_code().await
        }
        async fn write_start_code(&self, start_code: u64) -> Result<()> {
            self.0.write_start_code(start_code).await
        }
        async fn describe_backup_set(&self, name: &str) -> Result<Option<Vec<TableName>>> {
            self.0.describe_backup_set(name).await
        }
        async fn add_backup_set(&self, name: &str, tables: &[TableName]) -> Result<()> {
            self.0.add_backup_set(name, tables).await
        }
    }

    /// Copies existing sources into the target, or blocks until cancelled.
    struct FakeCopyTask {
        fs: MemoryFileSystem,
        status: i32,
        block: bool,
        cancelled: Mutex<Vec<String>>,
    }

    impl FakeCopyTask {
        fn new(fs: &MemoryFileSystem, status: i32, block: bool) -> Self {
            Self {
                fs: fs.clone(),
                status,
                block,
                cancelled: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BackupCopyTask for FakeCopyTask {
        async fn copy(&self, _run: &BackupRun, _t: BackupType, args: &[PathBuf]) -> Result<i32> {
            if self.block {
                std::future::pending::<()>().await;
            }
            if self.status != 0 {
                return Ok(self.status);
            }
            let (target, sources) = args.split_last().unwrap();
            for source in sources {
                if self.fs.contains(source) {
                    self.fs.insert(target.join(source.file_name().unwrap()));
                }
            }
            Ok(0)
        }

        async fn cancel(&self, job_handle: &str) -> Result<()> {
            self.cancelled.lock().unwrap().push(job_handle.to_string());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<TableMetadataStore<MemTable>>,
        task: Arc<FakeCopyTask>,
        ctx: RunContext,
    }

    fn fixture(status: i32, block: bool) -> Fixture {
        let fs = MemoryFileSystem::with_paths(["/logs/active/rs1/rs1.100", "/logs/active/rs2/rs2.200"]);
        let store = Arc::new(TableMetadataStore::new(MemTable::new()));
        let task = Arc::new(FakeCopyTask::new(&fs, status, block));
        let lister = Arc::new(FixedLister {
            files: vec![
                PathBuf::from("/logs/active/rs1/rs1.100"),
                PathBuf::from("/logs/active/rs2/rs2.200"),
            ],
            timestamps: ServerTimestamps::from([("rs1".to_string(), 100), ("rs2".to_string(), 200)]),
        });
        let ctx = RunContext {
            store: store.clone(),
            copy_task: task.clone(),
            lister,
            locator: LogFileLocator::new(Arc::new(fs), LogDirLayout::new("active", "archived")),
        };
        Fixture { store, task, ctx }
    }

    fn new_run(backup_type: BackupType, tables: &[&str]) -> BackupRun {
        BackupRun::new(
            "backup_100",
            BackupRequest {
                backup_type,
                tables: tables.iter().map(|t| t.parse().unwrap()).collect(),
                target_root_dir: PathBuf::from("/backup"),
                workers: None,
                bandwidth_mb: None,
            },
            1,
            0,
        )
    }

    #[tokio::test]
    async fn test_execute_completes_and_records() -> anyhow::Result<()> {
        let f = fixture(0, false);
        let mut manager = BackupLifecycleManager::new(new_run(BackupType::Incremental, &["t1"]), f.ctx.clone());
        manager.execute(CancellationToken::new()).await?;

        let run = manager.run();
        assert_eq!(run.state(), BackupState::Complete);
        assert_eq!(run.phase(), BackupPhase::Complete);
        assert!(run.end_ts.is_some());

        let stored = f.store.get_backup_run("backup_100").await?.unwrap();
        assert_eq!(stored.state(), BackupState::Complete);
        assert_eq!(f.store.read_wal_files("backup_100").await?.len(), 2);
        assert_eq!(f.store.read_start_code().await?, Some(100));
        Ok(())
    }

    #[tokio::test]
    async fn test_copy_failure_fails_run_once() -> anyhow::Result<()> {
        let f = fixture(3, false);
        let mut manager = BackupLifecycleManager::new(new_run(BackupType::Incremental, &["t1"]), f.ctx.clone());
        let err = manager.execute(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BackupError::CopyTaskFailure { status: 3, .. }));

        let stored = f.store.get_backup_run("backup_100").await?.unwrap();
        assert_eq!(stored.state(), BackupState::Failed);
        assert_eq!(stored.failure().unwrap().phase, BackupPhase::IncrementalCopy);
        assert_eq!(f.store.read_start_code().await?, None);

        // Second fail is a no-op
        manager.fail(&BackupError::Cancelled, "late").await;
        assert_eq!(manager.run().state(), BackupState::Failed);
        assert!(manager.run().failure().unwrap().message.contains("INCREMENTAL_COPY"));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_tables_rejected_and_persisted() -> anyhow::Result<()> {
        let f = fixture(0, false);
        let mut manager = BackupLifecycleManager::new(new_run(BackupType::Incremental, &[]), f.ctx.clone());
        let err = manager.execute(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));

        let stored = f.store.get_backup_run("backup_100").await?.unwrap();
        assert_eq!(stored.state(), BackupState::Failed);
        assert_eq!(stored.phase(), BackupPhase::Request);
        Ok(())
    }

    #[tokio::test]
    async fn test_full_backup_rejected() {
        let f = fixture(0, false);
        let mut manager = BackupLifecycleManager::new(new_run(BackupType::Full, &["t1"]), f.ctx.clone());
        assert!(matches!(manager.begin().await, Err(BackupError::Validation(_))));
    }

    #[tokio::test]
    async fn test_phase_order_enforced() -> anyhow::Result<()> {
        let f = fixture(0, false);
        let mut manager = BackupLifecycleManager::new(new_run(BackupType::Incremental, &["t1"]), f.ctx.clone());
        manager.begin().await?;
        manager.advance(BackupPhase::IncrementalCopy).await?;

        let err = manager.advance(BackupPhase::Prepare).await.unwrap_err();
        assert!(matches!(err, BackupError::PhaseOrder { .. }));
        assert!(matches!(manager.complete().await, Err(BackupError::InvalidState(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_during_copy() -> anyhow::Result<()> {
        let f = fixture(0, true);
        let mut manager = BackupLifecycleManager::new(new_run(BackupType::Incremental, &["t1"]), f.ctx.clone());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = manager.execute(cancel).await.unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        assert_eq!(manager.run().state(), BackupState::Cancelled);
        assert_eq!(*f.task.cancelled.lock().unwrap(), vec!["backup_100".to_string()]);

        let stored = f.store.get_backup_run("backup_100").await?.unwrap();
        assert_eq!(stored.state(), BackupState::Cancelled);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_during_prepare() -> anyhow::Result<()> {
        let f = fixture(0, false);
        let ctx = RunContext {
            lister: Arc::new(StalledLister),
            ..f.ctx.clone()
        };
        let mut manager = BackupLifecycleManager::new(new_run(BackupType::Incremental, &["t1"]), ctx);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = manager.execute(cancel).await.unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        assert_eq!(manager.run().state(), BackupState::Cancelled);

        let stored = f.store.get_backup_run("backup_100").await?.unwrap();
        assert_eq!(stored.state(), BackupState::Cancelled);
        assert_eq!(stored.failure().unwrap().phase, BackupPhase::Prepare);

        // No copy job was started and nothing was bookkept
        assert!(f.task.cancelled.lock().unwrap().is_empty());
        assert!(!f.task.fs.contains(Path::new("/backup/backup_100/WALs/rs1.100")));
        assert!(f.store.read_wal_files("backup_100").await?.is_empty());
        assert!(f.store.read_log_timestamp_map().await?.is_empty());
        assert_eq!(f.store.read_start_code().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_unpersisted_completion_fails_run() -> anyhow::Result<()> {
        let f = fixture(0, false);
        let ctx = RunContext {
            store: Arc::new(RejectCompleteStore(f.store.clone())),
            ..f.ctx.clone()
        };
        let mut manager = BackupLifecycleManager::new(new_run(BackupType::Incremental, &["t1"]), ctx);

        let err = manager.execute(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BackupError::Metadata(_)));

        let run = manager.run();
        assert_eq!(run.state(), BackupState::Failed);
        let failure = run.failure().unwrap();
        assert_eq!(failure.phase, BackupPhase::Bookkeeping);
        assert!(failure.cause.contains("disk full"));

        let stored = f.store.get_backup_run("backup_100").await?.unwrap();
        assert_eq!(stored.state(), BackupState::Failed);
        assert_eq!(stored.phase(), BackupPhase::Bookkeeping);
        Ok(())
    }

    #[tokio::test]
    async fn test_resumed_run_can_only_be_abandoned() -> anyhow::Result<()> {
        let f = fixture(0, false);
        let mut manager = BackupLifecycleManager::new(new_run(BackupType::Incremental, &["t1"]), f.ctx.clone());
        manager.begin().await?;
        drop(manager);

        let snapshot = f.store.get_backup_run("backup_100").await?.unwrap();
        let mut resumed = BackupLifecycleManager::resume(snapshot, f.ctx.clone());
        assert!(matches!(
            resumed.execute(CancellationToken::new()).await,
            Err(BackupError::InvalidState(_))
        ));
        assert_eq!(resumed.run().state(), BackupState::Running);

        resumed.abandon().await?;
        let stored = f.store.get_backup_run("backup_100").await?.unwrap();
        assert_eq!(stored.state(), BackupState::Failed);
        assert_eq!(stored.failure().unwrap().cause, "interrupted");
        assert!(resumed.abandon().await.is_err());
        Ok(())
    }
}
