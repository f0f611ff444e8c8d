//! Error types for the glyco_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for glyco_core operations
///
/// Only misconfiguration is a hard failure for the computation engines.
/// Missing or implausible glucose/treatment data degrades to empty or zero
/// results instead of surfacing here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Profile or settings misconfiguration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Input record that cannot be interpreted
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
