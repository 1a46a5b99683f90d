use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("duplicate change resolver: {0}")]
    DuplicateResolver(String),

    #[error("unknown change resolver: {0}")]
    UnknownResolver(String),

    #[error("change resolver {resolver} failed: {reason}")]
    Resolver { resolver: String, reason: String },

    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    #[error("cloud storage error: {0}")]
    CloudStorage(String),
}
