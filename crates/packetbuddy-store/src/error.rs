//! Error types for packetbuddy-store.

use std::path::PathBuf;

/// Result type for packetbuddy-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in packetbuddy-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The database file failed its integrity check or is not a database.
    ///
    /// This is the one fatal store error: the agent refuses to start rather
    /// than write into a file it cannot trust.
    #[error("Database is corrupt: {0}")]
    Corrupt(String),

    /// An operation needed the device identity before `register_device`.
    #[error("No device registered with this store")]
    DeviceNotRegistered,

    /// Invalid timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Invalid date or month key.
    #[error("Invalid date: {0}")]
    InvalidDate(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map SQLite errors that indicate a damaged file onto [`Error::Corrupt`].
    pub(crate) fn classify(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                Error::Corrupt(err.to_string())
            }
            _ => Error::Database(err),
        }
    }

    /// Whether this error means the database cannot be used at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Corrupt(_))
    }
}
