//! Storage error mapping into the core error type.

use pixiv_backup_core::{DatabaseError, Error};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Diesel(#[from] diesel::result::Error),

    #[error("Schema error: {0}")]
    Schema(String),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Pool(msg) => Error::Database(DatabaseError::Pool(msg)),
            StorageError::Diesel(e) => Error::Database(DatabaseError::Query(e.to_string())),
            StorageError::Schema(msg) => Error::Database(DatabaseError::Schema(msg)),
        }
    }
}
