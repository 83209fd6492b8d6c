//! Restore - command-line driver
//!
//! Restores tables from an incremental backup image. Exit codes:
//! 0 success, -1 backup disabled or missing arguments, -2 backup set lookup
//! failure, -3 empty or unknown backup set, -4 table mapping count mismatch,
//! -5 restore failure, 1 unparseable command line.

mod error;
mod restore;

use backup_engine::config::EngineConfig;
use backup_engine::copy::CopyTaskRegistry;
use backup_engine::metadata::{MetadataStore, SqliteMetadataStore};
use backup_engine::model::{parse_table_names, TableName};
use backup_engine::utils;
use clap::error::ErrorKind;
use clap::Parser;
use error::{RestoreError, EXIT_FAILURE, EXIT_OK, EXIT_PARSE_ERROR};
use restore::{ImageRestoreAdmin, RestoreAdmin, RestoreRequest};
use std::path::PathBuf;
use std::sync::Arc;

/// Log filter used with `--debug`.
const DEBUG_FILTER: &str = "info,backup_engine=debug,restore=debug";

#[derive(Parser, Debug)]
#[command(name = "restore", author, version, about, long_about = None)]
struct Args {
    /// Root directory the backup image was written under
    backup_root_dir: Option<PathBuf>,

    /// Backup id of the image to restore
    backup_id: Option<String>,

    /// Comma-separated list of tables to restore
    #[arg(conflicts_with = "set")]
    table_list: Option<String>,

    /// Overwrite existing restore output
    #[arg(short, long)]
    overwrite: bool,

    /// Only check that the image can be restored
    #[arg(short, long)]
    check: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Restore the tables of a named backup set
    #[arg(short, long, value_name = "NAME")]
    set: Option<String>,

    /// Comma-separated restore targets, matched positionally to the tables
    #[arg(short, long, value_name = "TABLES")]
    mapping: Option<String>,

    /// Path to configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.exit();
            }
            let _ = e.print();
            std::process::exit(EXIT_PARSE_ERROR);
        }
    };

    let config = match EngineConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    let level = if args.debug { DEBUG_FILTER } else { config.log.level.as_str() };
    if let Err(e) = utils::logger::init(level) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let code = match run(&args, &config).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            if let RestoreError::Execution(cause) = &e {
                tracing::error!("Restore failed: {cause}");
            }
            eprintln!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(args: &Args, config: &EngineConfig) -> Result<(), RestoreError> {
    config
        .ensure_backup_enabled()
        .map_err(|e| RestoreError::BackupDisabled(e.to_string()))?;

    let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::from_config(&config.metadata)?);
    let request = build_request(args, store.as_ref()).await?;
    let copy_task = CopyTaskRegistry::with_builtin().resolve_configured(config)?;

    let admin = ImageRestoreAdmin::new(store, copy_task);
    let report = admin.restore(&request).await?;

    if report.checked_only {
        println!("Backup {} can be restored", report.backup_id);
    } else {
        for staged in &report.staged {
            println!(
                "{} -> {}: {} file(s) staged in {}",
                staged.source,
                staged.target,
                staged.files,
                staged.dir.display()
            );
        }
    }
    Ok(())
}

/// Resolve positionals, backup set and mapping into a request.
async fn build_request(
    args: &Args,
    store: &dyn MetadataStore,
) -> Result<RestoreRequest, RestoreError> {
    let (Some(backup_root_dir), Some(backup_id)) = (&args.backup_root_dir, &args.backup_id) else {
        return Err(RestoreError::Usage(
            "Usage: restore <backup_root_dir> <backup_id> [table_list] [options]".to_string(),
        ));
    };

    let tables = match &args.set {
        Some(name) => resolve_set(store, name).await?,
        None => parse_tables(args.table_list.as_deref())?.ok_or_else(|| {
            RestoreError::Usage("a table list or a backup set (--set) is required".to_string())
        })?,
    };

    let target_tables = match parse_tables(args.mapping.as_deref())? {
        Some(targets) if targets.len() != tables.len() => {
            return Err(RestoreError::TableMappingMismatch {
                sources: tables.len(),
                targets: targets.len(),
            })
        }
        Some(targets) => targets,
        None => tables.clone(),
    };

    Ok(RestoreRequest {
        backup_root_dir: backup_root_dir.clone(),
        backup_id: backup_id.clone(),
        tables,
        target_tables,
        overwrite: args.overwrite,
        check: args.check,
    })
}

async fn resolve_set(store: &dyn MetadataStore, name: &str) -> Result<Vec<TableName>, RestoreError> {
    let tables = store
        .describe_backup_set(name)
        .await
        .map_err(|source| RestoreError::SetLookup {
            name: name.to_string(),
            source,
        })?;
    match tables {
        Some(tables) if !tables.is_empty() => Ok(tables),
        _ => Err(RestoreError::EmptySet(name.to_string())),
    }
}

fn parse_tables(list: Option<&str>) -> Result<Option<Vec<TableName>>, RestoreError> {
    parse_table_names(list).map_err(|e| RestoreError::Usage(e.to_string()))
}
