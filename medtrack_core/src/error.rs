//! Error types for the medtrack_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Validation failures rejected synchronously at the registry boundary.
///
/// The registry leaves its state unchanged when one of these is returned;
/// they are surfaced to the caller for user-facing correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("medication name must not be empty")]
    EmptyName,

    #[error("at least one reminder time is required")]
    NoReminderTimes,

    #[error("countable medications need a positive initial quantity")]
    InvalidQuantity,

    #[error("dose per time must be at least 1")]
    InvalidDose,
}

/// Core error type for medtrack_core operations
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

    /// Registry-boundary validation rejection
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}
