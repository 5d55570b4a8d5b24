use thiserror::Error;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum BeamdError {
    /// Configuration validation failed at startup.
    #[error("configuration error: {0}")]
    Config(String),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Cross-instance bus error.
    #[error("bus error: {0}")]
    Bus(#[from] redis::RedisError),
    /// JSON encoding or decoding error.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// A minted peer code collided with a registered one.
    #[error("peer code already registered: {0}")]
    DuplicateCode(String),
}
