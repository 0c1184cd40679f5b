//! Error types for the core crate.

use thiserror::Error;

/// Errors raised while interpreting configuration or rule input.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A pattern string failed to compile.
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern source.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// A rule set was registered without a marker.
    #[error("Rule set marker must not be empty")]
    EmptyMarker,

    /// Configuration could not be decoded.
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
