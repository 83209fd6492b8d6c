//! Error types for the backup engine.

use crate::model::BackupPhase;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Copy task failed with status {status} copying {} file(s) to {}", .sources.len(), .target.display())]
    CopyTaskFailure {
        status: i32,
        sources: Vec<PathBuf>,
        target: PathBuf,
    },

    #[error("Incremental copy could not finish the following files: {}", join_paths(.missing))]
    IncrementalCopyIncomplete { missing: Vec<PathBuf> },

    #[error("Corrupt backup state: {} is missing and is not under an active log directory", .path.display())]
    CorruptBackupState { path: PathBuf },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Metadata store error: {0}")]
    Metadata(String),

    /// Out-of-order phase advance. Indicates a bug in the caller, never retried.
    #[error("Illegal phase transition from {from} to {to}")]
    PhaseOrder { from: BackupPhase, to: BackupPhase },

    #[error("Invalid run state: {0}")]
    InvalidState(String),

    #[error("Backup cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BackupError>;

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl From<rusqlite::Error> for BackupError {
    fn from(e: rusqlite::Error) -> Self {
        BackupError::Metadata(e.to_string())
    }
}

impl From<r2d2::Error> for BackupError {
    fn from(e: r2d2::Error) -> Self {
        BackupError::Metadata(e.to_string())
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Metadata(format!("snapshot encoding: {e}"))
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Io(std::io::Error::other(e))
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(e: config::ConfigError) -> Self {
        BackupError::Configuration(e.to_string())
    }
}
