// Copyright 2025 Cowboy AI, LLC.

//! Error types for domain operations
//!
//! Each infrastructure module carries its own error enum; this module holds the
//! error an aggregate raises when it rejects a command, which every layer above
//! the aggregate has to carry through.

use thiserror::Error;

/// Errors raised by aggregates while deciding on a command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// Aggregate not found
    #[error("Aggregate not found: {0}")]
    AggregateNotFound(String),

    /// Aggregate already exists and the command only applies to new streams
    #[error("Aggregate already exists: {0}")]
    AlreadyExists(String),

    /// Invalid operation for the aggregate's current state
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Reason why the operation is invalid
        reason: String,
    },

    /// Invariant violation
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Business rule violation
    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation {
        /// Description of the violated rule
        rule: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for domain operations
pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

impl DomainError {
    /// Create an invalid operation error
    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        DomainError::InvalidOperation {
            reason: reason.into(),
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, DomainError::AggregateNotFound(_))
    }

    /// Check if this is a validation error
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            DomainError::ValidationError(_)
                | DomainError::InvariantViolation(_)
                | DomainError::BusinessRuleViolation { .. }
        )
    }
}
