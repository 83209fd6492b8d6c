//! Backup Engine Library
//!
//! Incremental backup of a column-family storage cluster: copies the write-ahead
//! log segments written since the previous run into a backup image, tolerating
//! segments rotated into the archive mid-copy, then advances the per-table log
//! timestamps and the global start code.

pub mod bookkeeping;
pub mod client;
pub mod config;
pub mod copy;
pub mod daemon;
pub mod fs;
pub mod lifecycle;
pub mod metadata;
pub mod model;
pub mod session;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use lifecycle::{BackupLifecycleManager, RunContext};
pub use utils::{BackupError, Result};
