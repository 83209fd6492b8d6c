//! Locating log segments at their source and destination, and translating
//! segments that were rotated from the active to the archived directory.

use super::FileSystem;
use crate::config::WalConfig;
use crate::utils::{BackupError, Result};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Names of the active and archived log directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirLayout {
    pub active_dir_name: String,
    pub archived_dir_name: String,
}

impl LogDirLayout {
    pub fn new(active_dir_name: impl Into<String>, archived_dir_name: impl Into<String>) -> Self {
        Self {
            active_dir_name: active_dir_name.into(),
            archived_dir_name: archived_dir_name.into(),
        }
    }

    pub fn from_config(config: &WalConfig) -> Self {
        Self::new(&config.active_dir_name, &config.archived_dir_name)
    }

    pub fn active_dir(&self, wal_root: &Path) -> PathBuf {
        wal_root.join(&self.active_dir_name)
    }

    pub fn archived_dir(&self, wal_root: &Path) -> PathBuf {
        wal_root.join(&self.archived_dir_name)
    }

    /// Rewrite `path` so its active log directory component names the archived
    /// directory instead. Only that component changes.
    ///
    /// The last matching directory component is the one replaced; the file
    /// name itself is never a candidate.
    pub fn to_archived(&self, path: &Path) -> Result<PathBuf> {
        let components: Vec<Component<'_>> = path.components().collect();
        let marker = OsStr::new(&self.active_dir_name);
        let dir_count = components.len().saturating_sub(1);

        let Some(idx) = components[..dir_count]
            .iter()
            .rposition(|c| matches!(c, Component::Normal(name) if *name == marker))
        else {
            return Err(BackupError::CorruptBackupState {
                path: path.to_path_buf(),
            });
        };

        let mut rewritten = PathBuf::new();
        for (i, component) in components.iter().enumerate() {
            if i == idx {
                rewritten.push(&self.archived_dir_name);
            } else {
                rewritten.push(component.as_os_str());
            }
        }
        Ok(rewritten)
    }
}

impl Default for LogDirLayout {
    fn default() -> Self {
        Self::from_config(&WalConfig::default())
    }
}

/// Existence checks for a backup run's log segments.
#[derive(Clone)]
pub struct LogFileLocator {
    fs: Arc<dyn FileSystem>,
    layout: LogDirLayout,
}

impl LogFileLocator {
    pub fn new(fs: Arc<dyn FileSystem>, layout: LogDirLayout) -> Self {
        Self { fs, layout }
    }

    pub fn layout(&self) -> &LogDirLayout {
        &self.layout
    }

    /// Where the copy backend places `source` under `target_dir`.
    pub fn destination_of(source: &Path, target_dir: &Path) -> Result<PathBuf> {
        source
            .file_name()
            .map(|name| target_dir.join(name))
            .ok_or_else(|| BackupError::CorruptBackupState {
                path: source.to_path_buf(),
            })
    }

    /// The subset of `paths` that currently exists at the source, in order.
    pub async fn existing(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut found = Vec::with_capacity(paths.len());
        for path in paths {
            if self.fs.exists(path).await? {
                found.push(path.clone());
            } else {
                warn!("Can't find file: {}", path.display());
            }
        }
        Ok(found)
    }

    /// Paths that exist at the source and have not yet reached `target_dir`.
    pub async fn pending(&self, paths: &[PathBuf], target_dir: &Path) -> Result<Vec<PathBuf>> {
        let existing = self.existing(paths).await?;
        let mut pending = Vec::with_capacity(existing.len());
        for path in existing {
            let dest = Self::destination_of(&path, target_dir)?;
            if self.fs.exists(&dest).await? {
                debug!("Already copied: {}", path.display());
            } else {
                pending.push(path);
            }
        }
        Ok(pending)
    }

    /// Sources whose copy is absent from `target_dir`.
    pub async fn missing_at_destination(
        &self,
        sources: &[PathBuf],
        target_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut missing = Vec::new();
        for source in sources {
            let dest = Self::destination_of(source, target_dir)?;
            if !self.fs.exists(&dest).await? {
                missing.push(source.clone());
            }
        }
        Ok(missing)
    }

    /// Translate every path to its archived location; fails on the first path
    /// with no active log directory component.
    pub fn to_archived(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        paths
            .iter()
            .map(|p| {
                self.layout.to_archived(p).inspect_err(|_| {
                    warn!("Copy incremental log files failed, file is missing: {}", p.display());
                })
            })
            .collect()
    }
}
