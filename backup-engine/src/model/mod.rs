//! Backup run record, table identifiers and log timestamp bookkeeping types.

pub mod run;
pub mod table;
pub mod timestamps;

pub use run::{
    generate_backup_id, BackupPhase, BackupRequest, BackupRun, BackupState, BackupType,
    FailureRecord, IMAGE_LOG_DIR,
};
pub use table::{join_table_names, parse_table_names, TableName, TABLE_DELIMITER};
pub use timestamps::{compute_start_code, region_server_minimums, ServerTimestamps, TimestampMap};
