//! Configuration management for the backup engine.
//!
//! Loads configuration from an optional TOML file with environment variable
//! overrides (`BACKUP_ENGINE__<SECTION>__<KEY>`).

use crate::utils::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "BACKUP_ENGINE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub copy: CopyConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Cluster-wide feature switch
    #[serde(default)]
    pub enabled: bool,

    /// Registry key of the copy backend
    #[serde(default = "default_copy_task")]
    pub copy_task: String,

    /// Default copy parallelism when a request does not name one
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Default bandwidth cap in MB/s (0 = unlimited)
    #[serde(default)]
    pub bandwidth_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Root directory holding the active and archived log directories
    #[serde(default = "default_wal_root")]
    pub root_dir: PathBuf,

    /// Directory name of live log segments
    #[serde(default = "default_active_dir")]
    pub active_dir_name: String,

    /// Directory name segments are moved to once rotated out
    #[serde(default = "default_archived_dir")]
    pub archived_dir_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Program run by the `command` copy backend
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments placed before the sources and the destination
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_copy_task() -> String {
    "local".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_wal_root() -> PathBuf {
    PathBuf::from("/var/lib/hbase")
}

fn default_active_dir() -> String {
    "WALs".to_string()
}

fn default_archived_dir() -> String {
    "oldWALs".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/backup-engine/backup-meta.db")
}

fn default_pool_size() -> u32 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            copy_task: default_copy_task(),
            workers: default_workers(),
            bandwidth_mb: 0,
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            root_dir: default_wal_root(),
            active_dir_name: default_active_dir(),
            archived_dir_name: default_archived_dir(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Fail when the backup feature is switched off cluster-wide.
    pub fn ensure_backup_enabled(&self) -> Result<()> {
        if self.backup.enabled {
            Ok(())
        } else {
            Err(BackupError::Configuration(
                "Backup is not enabled. To enable backup, set backup.enabled = true \
                 and restart the cluster"
                    .to_string(),
            ))
        }
    }

    fn validate(&self) -> Result<()> {
        if self.wal.active_dir_name.is_empty() || self.wal.archived_dir_name.is_empty() {
            return Err(BackupError::Configuration(
                "wal.active_dir_name and wal.archived_dir_name must not be empty".to_string(),
            ));
        }
        if self.wal.active_dir_name == self.wal.archived_dir_name {
            return Err(BackupError::Configuration(
                "active and archived log directories must differ".to_string(),
            ));
        }
        if self.wal.active_dir_name.contains('/') || self.wal.archived_dir_name.contains('/') {
            return Err(BackupError::Configuration(
                "log directory names must be a single path component".to_string(),
            ));
        }
        Ok(())
    }
}
