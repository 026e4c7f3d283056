use std::error::Error;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error raised by durable event stores regardless of the underlying medium.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend could not be read or written.
    #[error("storage unavailable: {message}")]
    Unavailable {
        /// What failed.
        message: String,
        /// Backend error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Stored payload did not deserialize.
    #[error("stored payload for `{key}` is corrupt")]
    Corrupt {
        /// Storage key holding the payload.
        key: String,
        /// Deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        StorageError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}
