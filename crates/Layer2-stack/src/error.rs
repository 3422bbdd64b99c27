//! Stack resolution errors

use burrow_foundation::Error as FoundationError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StackError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    #[error("Unknown tech stack: {0}")]
    UnknownStack(String),

    /// Catalog bug: dependency edges must form a DAG
    #[error("Dependency cycle through tech stack: {0}")]
    DependencyCycle(String),
}

impl From<StackError> for FoundationError {
    fn from(err: StackError) -> Self {
        match err {
            StackError::UnknownStack(_) => FoundationError::Validation(err.to_string()),
            StackError::DependencyCycle(_) => FoundationError::Internal(err.to_string()),
        }
    }
}
