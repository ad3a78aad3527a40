//! Storage error types for the user store abstraction.
//!
//! "Not found" is not an error here: lookups return `Ok(None)` and the
//! cache layer treats that as a first-class outcome.

use std::fmt;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A unique constraint rejected the write.
    ///
    /// This is the storage engine's last line of defence; callers that hold
    /// an application-level lock should rarely see it.
    #[error("Unique constraint violated{}", constraint.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    UniqueViolation {
        /// Name of the violated constraint, when the backend reports one.
        constraint: Option<String>,
    },

    /// The record to update or delete does not exist.
    #[error("Record not found: {key}")]
    NotFound {
        /// Natural key of the missing record.
        key: String,
    },

    /// The record data is invalid.
    #[error("Invalid record: {message}")]
    InvalidRecord {
        /// Description of why the record is invalid.
        message: String,
    },

    /// An error occurred during a transaction.
    #[error("Transaction error: {message}")]
    TransactionError {
        /// Description of the transaction error.
        message: String,
    },

    /// Failed to reach the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `UniqueViolation` error.
    #[must_use]
    pub fn unique_violation(constraint: Option<&str>) -> Self {
        Self::UniqueViolation {
            constraint: constraint.map(str::to_string),
        }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `InvalidRecord` error.
    #[must_use]
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Creates a new `TransactionError` error.
    #[must_use]
    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if a unique constraint rejected the write.
    #[must_use]
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }

    /// Returns `true` if the targeted record does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UniqueViolation { .. } => ErrorCategory::Conflict,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::InvalidRecord { .. } => ErrorCategory::Validation,
            Self::TransactionError { .. } => ErrorCategory::Transaction,
            Self::ConnectionError { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Record not found.
    NotFound,
    /// Uniqueness conflict.
    Conflict,
    /// Validation error.
    Validation,
    /// Transaction-related error.
    Transaction,
    /// Infrastructure/connection error.
    Infrastructure,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Validation => write!(f, "validation"),
            Self::Transaction => write!(f, "transaction"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::unique_violation(Some("uk_username"));
        assert_eq!(err.to_string(), "Unique constraint violated: uk_username");

        let err = StorageError::unique_violation(None);
        assert_eq!(err.to_string(), "Unique constraint violated");

        let err = StorageError::not_found("alice");
        assert_eq!(err.to_string(), "Record not found: alice");
    }

    #[test]
    fn test_error_predicates() {
        let err = StorageError::unique_violation(None);
        assert!(err.is_unique_violation());
        assert!(!err.is_not_found());

        let err = StorageError::not_found("bob");
        assert!(err.is_not_found());
        assert!(!err.is_unique_violation());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::unique_violation(None).category(),
            ErrorCategory::Conflict
        );
        assert_eq!(
            StorageError::connection_error("refused").category(),
            ErrorCategory::Infrastructure
        );
        assert_eq!(ErrorCategory::Transaction.to_string(), "transaction");
    }
}
