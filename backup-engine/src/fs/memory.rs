//! In-process filesystem view.

use super::FileSystem;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// A set of paths that "exist". Clones share the same set, so a copy backend
/// and the session can observe each other's changes.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    paths: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let fs = Self::new();
        for p in paths {
            fs.insert(p);
        }
        fs
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, path: impl Into<PathBuf>) {
        self.lock().insert(path.into());
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.lock().remove(path)
    }

    /// Move `from` to `to`, as log rotation does.
    pub fn rename(&self, from: &Path, to: impl Into<PathBuf>) -> bool {
        let mut paths = self.lock();
        if paths.remove(from) {
            paths.insert(to.into());
            true
        } else {
            false
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.contains(path))
    }
}
