//! Error types for the Floodgate engine.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors (invalid or unknown limiter).
    ///
    /// These surface at registration time and must fail fast; they are
    /// never converted into an "unlimited" pass at request time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backing counter store is unreachable or timed out.
    ///
    /// The admission middleware converts this into fail-open passage;
    /// the engine itself only reports it.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
