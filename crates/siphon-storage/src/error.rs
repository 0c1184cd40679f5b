//! Storage error types.

use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from rusqlite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error (body files, directories, renames).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Body could not be decoded for writing.
    #[error("Invalid body: {0}")]
    InvalidBody(String),

    /// Relative path escapes its storage root.
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),

    /// Record changed between planning and applying a move.
    #[error("Conflicting update: {0}")]
    Conflict(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
