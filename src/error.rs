//! Error types for the Turnstile admission layer.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Only construction-time problems surface through this type. Limit and
/// capacity outcomes are ordinary values, and downstream failures are
/// absorbed by the pipeline's error boundary.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Invalid or conflicting configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while layering configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

/// Boxed error raised by a middleware stage or terminal handler.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result returned by every pipeline stage.
pub type HandlerResult = std::result::Result<(), BoxError>;
