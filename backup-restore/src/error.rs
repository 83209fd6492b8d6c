use backup_engine::BackupError;

pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = -1;
pub const EXIT_SET_LOOKUP: i32 = -2;
pub const EXIT_EMPTY_SET: i32 = -3;
pub const EXIT_TABLE_MISMATCH: i32 = -4;
pub const EXIT_FAILURE: i32 = -5;
/// Reported for command-line parse errors.
pub const EXIT_PARSE_ERROR: i32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum RestoreError {
    #[error("{0}")]
    BackupDisabled(String),

    #[error("{0}")]
    Usage(String),

    #[error("Failed to look up backup set '{name}': {source}")]
    SetLookup { name: String, source: BackupError },

    #[error("Backup set '{0}' is empty or does not exist")]
    EmptySet(String),

    #[error("Number of source tables ({sources}) and target tables ({targets}) do not match")]
    TableMappingMismatch { sources: usize, targets: usize },

    #[error(transparent)]
    Execution(#[from] BackupError),
}

impl RestoreError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RestoreError::BackupDisabled(_) | RestoreError::Usage(_) => EXIT_USAGE,
            RestoreError::SetLookup { .. } => EXIT_SET_LOOKUP,
            RestoreError::EmptySet(_) => EXIT_EMPTY_SET,
            RestoreError::TableMappingMismatch { .. } => EXIT_TABLE_MISMATCH,
            RestoreError::Execution(_) => EXIT_FAILURE,
        }
    }
}
