use thiserror::Error;

/// Result alias carrying [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
/// # Engine Error
///
/// Failures raised by collaborators of the engine: storage backends, the
/// configuration loader and the logging setup. None of these ever reach a
/// consumer; the registry logs and swallows them.
pub enum EngineError {
    /// An I/O error occurred, typically while reading a config file or a storage document.
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    /// A JSON document could not be encoded or decoded.
    #[error("JSON error occurred: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The storage backend refused or failed an operation.
    #[error("Storage error for client {client}: {reason}")]
    StorageError {
        /// Sanitised storage namespace of the engine.
        client: String,
        /// Human readable cause.
        reason: String,
    },

    /// The engine configuration is unusable.
    #[error("Invalid engine configuration: {0}")]
    ConfigError(String),

    /// The Redis storage backend reported an error.
    #[cfg(feature = "connections")]
    #[error("Redis error occurred: {0}")]
    RedisError(#[from] redis::RedisError),

    /// The logging subsystem could not be installed.
    #[error("Logger setup failed: {0}")]
    LoggerError(String),
}

impl EngineError {
    /// Builds a [`EngineError::StorageError`] for the given client namespace.
    pub fn storage<C: Into<String>, R: Into<String>>(client: C, reason: R) -> Self {
        Self::StorageError {
            client: client.into(),
            reason: reason.into(),
        }
    }
}
