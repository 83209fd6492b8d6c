//! Backup Engine - Main entry point
//!
//! Runs one incremental backup, or sweeps runs left RUNNING by a crashed process.

use anyhow::{anyhow, Context, Result};
use backup_engine::config::EngineConfig;
use backup_engine::copy::CopyTaskRegistry;
use backup_engine::daemon::shutdown;
use backup_engine::fs::{LocalFileSystem, LogDirLayout, LogFileLocator, WalDirectoryLister};
use backup_engine::metadata::{MetadataStore, SqliteMetadataStore};
use backup_engine::model::{
    generate_backup_id, parse_table_names, BackupRequest, BackupRun, BackupState, BackupType,
};
use backup_engine::{utils, BackupLifecycleManager, RunContext};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one incremental backup
    Run {
        /// TOML file describing the request
        #[arg(short, long, value_name = "FILE", conflicts_with_all = ["tables", "target_root"])]
        request: Option<PathBuf>,

        /// Comma-separated list of tables
        #[arg(short, long)]
        tables: Option<String>,

        /// Backup root directory
        #[arg(long, value_name = "DIR")]
        target_root: Option<PathBuf>,

        /// Copy parallelism (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Bandwidth cap in MB/s (overrides config)
        #[arg(short, long)]
        bandwidth: Option<u64>,
    },

    /// Fail runs left RUNNING by an interrupted process
    Recover,

    /// Create or replace a named backup set
    AddSet {
        name: String,
        /// Comma-separated list of tables
        tables: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = EngineConfig::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting backup-engine v{}", env!("CARGO_PKG_VERSION"));

    config.ensure_backup_enabled()?;

    let store: Arc<dyn MetadataStore> = Arc::new(
        SqliteMetadataStore::from_config(&config.metadata)
            .with_context(|| format!("opening {}", config.metadata.db_path.display()))?,
    );

    match args.command {
        Command::Run {
            request,
            tables,
            target_root,
            workers,
            bandwidth,
        } => {
            let mut request = match request {
                Some(path) => read_request(&path)?,
                None => BackupRequest {
                    backup_type: BackupType::Incremental,
                    tables: parse_table_names(tables.as_deref())?
                        .ok_or_else(|| anyhow!("--tables or --request is required"))?,
                    target_root_dir: target_root
                        .ok_or_else(|| anyhow!("--target-root or --request is required"))?,
                    workers: None,
                    bandwidth_mb: None,
                },
            };
            request.workers = workers.or(request.workers);
            request.bandwidth_mb = bandwidth.or(request.bandwidth_mb);
            run_backup(&config, store, request).await
        }
        Command::Recover => recover(&config, store).await,
        Command::AddSet { name, tables } => {
            let tables = parse_table_names(Some(&tables))?.unwrap_or_default();
            store.add_backup_set(&name, &tables).await?;
            tracing::info!("Backup set '{}' now holds {} table(s)", name, tables.len());
            Ok(())
        }
    }
}

fn read_request(path: &std::path::Path) -> Result<BackupRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading request {}", path.display()))?;
    Ok(toml::from_str(&text)?)
}

fn run_context(config: &EngineConfig, store: Arc<dyn MetadataStore>) -> Result<RunContext> {
    let layout = LogDirLayout::from_config(&config.wal);
    Ok(RunContext {
        store,
        copy_task: CopyTaskRegistry::with_builtin().resolve_configured(config)?,
        lister: Arc::new(WalDirectoryLister::new(config.wal.root_dir.clone(), layout.clone())),
        locator: LogFileLocator::new(Arc::new(LocalFileSystem), layout),
    })
}

async fn run_backup(
    config: &EngineConfig,
    store: Arc<dyn MetadataStore>,
    request: BackupRequest,
) -> Result<()> {
    let ctx = run_context(config, store)?;
    let run = BackupRun::new(
        generate_backup_id(),
        request,
        config.backup.workers,
        config.backup.bandwidth_mb,
    );
    let backup_id = run.backup_id.clone();

    let cancel = CancellationToken::new();
    let watcher = shutdown::cancel_on_signal(cancel.clone());

    let mut manager = BackupLifecycleManager::new(run, ctx);
    let result = manager.execute(cancel.clone()).await;

    // Stop the signal watcher
    cancel.cancel();
    let _ = watcher.await;

    result?;
    tracing::info!("Backup {} completed", backup_id);
    println!("{}", backup_id);
    Ok(())
}

async fn recover(config: &EngineConfig, store: Arc<dyn MetadataStore>) -> Result<()> {
    let ctx = run_context(config, store.clone())?;
    let running = store.list_backup_runs(Some(BackupState::Running)).await?;
    let count = running.len();

    for snapshot in running {
        let mut manager = BackupLifecycleManager::resume(snapshot, ctx.clone());
        manager.abandon().await?;
    }

    tracing::info!("Recovery finished, {} interrupted run(s) marked failed", count);
    Ok(())
}
