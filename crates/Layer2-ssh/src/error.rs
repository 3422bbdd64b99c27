//! SSH-specific error types

use burrow_foundation::Error as FoundationError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, SshError>;

/// Errors from connecting, authenticating, and running commands over SSH
#[derive(Error, Debug)]
pub enum SshError {
    /// TCP or handshake failure
    #[error("SSH connect to {target} failed: {message}")]
    Connect { target: String, message: String },

    /// Server rejected every offered credential
    #[error("SSH authentication failed for {target}")]
    Authentication { target: String },

    /// No key found on disk and no password supplied
    #[error("No SSH identity available (tried: {tried})")]
    NoIdentity { tried: String },

    /// Private key could not be read or parsed
    #[error("Failed to load SSH key {path}: {message}")]
    KeyLoad { path: String, message: String },

    /// Command line could not be built (bad env name, unquotable arg)
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Channel-level failure after connecting
    #[error("SSH channel error: {0}")]
    Channel(String),

    /// Interactive stream already closed
    #[error("Stream closed")]
    StreamClosed,

    #[error("Timed out after {elapsed_secs}s waiting for {what}")]
    Timeout { what: String, elapsed_secs: u64 },
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Channel(err.to_string())
    }
}

// ============================================================================
// burrow_foundation::Error conversion
// ============================================================================

impl From<SshError> for FoundationError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::Timeout { .. } => FoundationError::Timeout(err.to_string()),
            SshError::NoIdentity { .. } | SshError::KeyLoad { .. } => {
                FoundationError::Config(err.to_string())
            }
            SshError::InvalidCommand(msg) => FoundationError::InvalidInput(msg),
            other => FoundationError::Remote(other.to_string()),
        }
    }
}
