//! Error types for Burrow
//!
//! Shared error type for the foundation layer. Higher layers keep their own
//! detailed error enums and convert into this one at crate boundaries.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Burrow foundation error
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Storage
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // Hypervisor / remote execution
    // ========================================================================
    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    #[error("Remote execution error: {0}")]
    Remote(String),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    // ========================================================================
    // Execution
    // ========================================================================
    #[error("Timeout: {0}")]
    Timeout(String),

    // ========================================================================
    // General
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // ========================================================================
    // Conversions from external errors
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the whole operation might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Hypervisor(_) | Error::Remote(_))
    }

    /// Whether the message is safe and useful to show to an end user as-is
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::InvalidInput(_) | Error::Validation(_) | Error::Config(_)
        )
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}
