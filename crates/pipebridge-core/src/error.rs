//! Error types for `pipebridge` core library.

use thiserror::Error;

/// Result type alias using `pipebridge` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `pipebridge` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unknown policy name
    #[error("Unknown {kind} policy: {value}")]
    UnknownPolicy { kind: &'static str, value: String },
}
