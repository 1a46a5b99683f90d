use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("batch rejected: {0}")]
    BatchRejected(String),

    #[error("timed out waiting for lock: {0}")]
    LockTimeout(String),

    #[error("core error: {0}")]
    Core(#[from] groupsync_core::CoreError),
}

impl StorageError {
    /// Translates a failed write, turning uniqueness failures into
    /// `ConstraintViolation` with the given context.
    pub(crate) fn from_write(err: rusqlite::Error, context: impl FnOnce() -> String) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StorageError::ConstraintViolation(context())
            }
            rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DatabaseBusy => {
                StorageError::LockTimeout(context())
            }
            other => StorageError::Sqlite(other),
        }
    }
}
