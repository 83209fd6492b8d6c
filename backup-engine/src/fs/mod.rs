//! Filesystem views used to check log segment existence.
//!
//! The engine only ever asks whether a path exists; everything else about the
//! source and destination filesystems belongs to the copy backend.

pub mod lister;
pub mod locator;
pub mod memory;

pub use lister::{IncrementalLogList, IncrementalLogLister, WalDirectoryLister};
pub use locator::{LogDirLayout, LogFileLocator};
pub use memory::MemoryFileSystem;

use crate::Result;
use async_trait::async_trait;
use std::path::Path;

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Whether `path` exists. Faults are errors, never "missing".
    async fn exists(&self, path: &Path) -> Result<bool>;
}

/// The local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }
}
