//! Error types for the core crate.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Secret store backend failure (keyring, database, poisoned lock)
    #[error("Secret store error: {0}")]
    Secret(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored or received data does not have the expected shape
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    pub fn secret(message: impl Into<String>) -> Self {
        Self::Secret(message.into())
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }
}
