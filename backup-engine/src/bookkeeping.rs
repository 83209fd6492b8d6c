//! Post-copy bookkeeping: per-table log timestamps, then the start code.
//!
//! The start code is written strictly after the timestamp map it is derived
//! from. A crash between the two writes leaves the previous start code, which
//! is never larger than the one the new map would yield.

use crate::metadata::MetadataStore;
use crate::model::{compute_start_code, BackupRun, ServerTimestamps, TimestampMap};
use crate::utils::Result;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookkeepingOutcome {
    /// The per-table map as it was before this run.
    pub previous: TimestampMap,
    /// The start code in force after this run, if any table has timestamps.
    pub start_code: Option<u64>,
}

pub async fn record_run(
    store: &dyn MetadataStore,
    run: &BackupRun,
    new_timestamps: &ServerTimestamps,
) -> Result<BookkeepingOutcome> {
    let previous = store.read_log_timestamp_map().await?;

    store
        .write_region_server_log_timestamps(&run.tables, new_timestamps)
        .await?;
    debug!(
        backup_id = %run.backup_id,
        tables = run.tables.len(),
        servers = new_timestamps.len(),
        "Wrote region server log timestamps"
    );

    let current = store.read_log_timestamp_map().await?;
    let Some(computed) = compute_start_code(&current) else {
        debug!(backup_id = %run.backup_id, "No log timestamps recorded, start code unchanged");
        return Ok(BookkeepingOutcome {
            previous,
            start_code: None,
        });
    };

    let start_code = match store.read_start_code().await? {
        Some(persisted) if computed < persisted => {
            warn!(
                backup_id = %run.backup_id,
                computed,
                persisted,
                "Computed start code is behind the persisted one, keeping the persisted value"
            );
            persisted
        }
        _ => {
            store.write_start_code(computed).await?;
            computed
        }
    };

    info!(backup_id = %run.backup_id, start_code, "Backup bookkeeping done");
    Ok(BookkeepingOutcome {
        previous,
        start_code: Some(start_code),
    })
}
