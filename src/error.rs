//! Error types for the tokenmeter crate.

use thiserror::Error;

/// Main error type for tokenmeter operations.
///
/// Store failures are deliberately absent: they are absorbed at the meter and
/// reservation boundaries and never reach callers of the admission API.
#[derive(Error, Debug)]
pub enum TokenMeterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for tokenmeter operations.
pub type Result<T> = std::result::Result<T, TokenMeterError>;
