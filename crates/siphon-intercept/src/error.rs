//! Interception error types.

use siphon_storage::StorageError;
use thiserror::Error;

/// Broad category of an interception failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Parse,
    Persistence,
    Protocol,
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Parse => "parse",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

/// Errors raised while handling an intercepted exchange.
#[derive(Debug, Error)]
pub enum InterceptError {
    /// Revalidation request failed on the network.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed header, body or payload.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Cache record or body could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// Instrumentation channel refused a command.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InterceptError {
    /// Category used when logging.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InterceptError::Transport(_) => ErrorKind::Transport,
            InterceptError::Parse(_) => ErrorKind::Parse,
            InterceptError::Persistence(_) => ErrorKind::Persistence,
            InterceptError::Protocol(_) => ErrorKind::Protocol,
            InterceptError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<reqwest::Error> for InterceptError {
    fn from(e: reqwest::Error) -> Self {
        InterceptError::Transport(e.to_string())
    }
}

impl From<base64::DecodeError> for InterceptError {
    fn from(e: base64::DecodeError) -> Self {
        InterceptError::Parse(e.to_string())
    }
}

/// Result type for interception operations.
pub type Result<T> = std::result::Result<T, InterceptError>;
