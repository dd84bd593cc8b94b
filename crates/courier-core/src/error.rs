//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Session identifier could not be derived from the given input
    #[error("Invalid session id: {input:?} (expected at least one digit)")]
    InvalidSessionId { input: String },

    /// Target could not be normalized into an address
    #[error("Invalid target: {input:?}")]
    InvalidTarget { input: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
