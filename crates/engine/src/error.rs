use groupsync_core::CoreError;
use groupsync_storage::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Coarse outcome class reported to clients alongside any error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusCategory {
    #[serde(rename = "OK")]
    Ok,
    Unauthorized,
    Conflict,
    InternalError,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// The client's master version is stale; it should re-pull the file index
    /// and retry the whole batch.
    #[error("master version conflict: current version is {current}")]
    MasterVersionConflict { current: u64 },

    #[error("batch rejected: {0}")]
    BatchRejected(String),

    #[error("file version conflict for {file}: expected {expected}, got {declared}")]
    FileVersionConflict { file: String, expected: u32, declared: u32 },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("change resolver failed: {0}")]
    Resolver(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("core error: {0}")]
    Core(CoreError),
}

impl SyncError {
    pub fn category(&self) -> StatusCategory {
        match self {
            Self::Unauthorized(_) => StatusCategory::Unauthorized,
            Self::MasterVersionConflict { .. } | Self::BatchRejected(_) | Self::FileVersionConflict { .. } => {
                StatusCategory::Conflict
            }
            Self::Validation(_) | Self::Transaction(_) | Self::Resolver(_) | Self::Storage(_) | Self::Core(_) => {
                StatusCategory::InternalError
            }
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Validation(msg) => Self::Validation(msg),
            StorageError::BatchRejected(msg) => Self::BatchRejected(msg),
            StorageError::LockTimeout(msg) => Self::Transaction(format!("lock wait timed out: {msg}")),
            StorageError::Core(core) => core.into(),
            other => Self::Storage(other),
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unauthenticated(msg) => Self::Unauthorized(msg),
            CoreError::Resolver { .. } | CoreError::UnknownResolver(_) => Self::Resolver(err.to_string()),
            other => Self::Core(other),
        }
    }
}
