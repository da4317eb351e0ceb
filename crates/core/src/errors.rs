//! Error types shared across the workspace.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the backup core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A durable document on disk could not be understood.
    #[error("Corrupt state file {path}: {message}")]
    CorruptState { path: String, message: String },

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn corrupt_state(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptState {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Database-layer errors, wrapped by the storage crate.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Schema error: {0}")]
    Schema(String),
}
