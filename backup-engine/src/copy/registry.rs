//! Registry mapping a configuration key to a copy backend constructor.
//!
//! Resolved once when a run starts; the constructed backend is handed to the
//! copy session, which never looks anything up itself.

use super::{BackupCopyTask, CommandCopyTask, LocalCopyTask};
use crate::config::EngineConfig;
use crate::utils::{BackupError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub type CopyTaskConstructor = fn(&EngineConfig) -> Result<Arc<dyn BackupCopyTask>>;

pub struct CopyTaskRegistry {
    constructors: HashMap<String, CopyTaskConstructor>,
}

impl CopyTaskRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the `local` and `command` backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("local", build_local);
        registry.register("command", build_command);
        registry
    }

    /// Register a backend, replacing any previous constructor for `key`.
    pub fn register(&mut self, key: impl Into<String>, constructor: CopyTaskConstructor) {
        self.constructors.insert(key.into(), constructor);
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn resolve(&self, key: &str, config: &EngineConfig) -> Result<Arc<dyn BackupCopyTask>> {
        let constructor = self.constructors.get(key).ok_or_else(|| {
            BackupError::Configuration(format!(
                "unknown copy task '{}', expected one of: {}",
                key,
                self.keys().join(", ")
            ))
        })?;
        debug!(copy_task = key, "Resolved copy task");
        constructor(config)
    }

    /// Resolve the backend named by `backup.copy_task`.
    pub fn resolve_configured(&self, config: &EngineConfig) -> Result<Arc<dyn BackupCopyTask>> {
        self.resolve(&config.backup.copy_task, config)
    }
}

impl Default for CopyTaskRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn build_local(_config: &EngineConfig) -> Result<Arc<dyn BackupCopyTask>> {
    Ok(Arc::new(LocalCopyTask::new()))
}

fn build_command(config: &EngineConfig) -> Result<Arc<dyn BackupCopyTask>> {
    let program = config
        .copy
        .command
        .clone()
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            BackupError::Configuration("copy.command is required by the command copy task".to_string())
        })?;
    Ok(Arc::new(CommandCopyTask::new(program, config.copy.args.clone())))
}
