//! Public error taxonomy for the Viking context engine.
//!
//! Every failure that crosses a public API boundary maps to exactly one
//! [`ErrorCode`]. Queue workers never surface these to callers directly; they
//! record `last_error` on the affected job instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumerates the stable public failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    UnsupportedFormat,
    NotProcessed,
    InvariantViolation,
    ResourceExhausted,
    Timeout,
    Cancelled,
    DependencyError,
}

impl ErrorCode {
    /// Returns the stable SCREAMING_SNAKE_CASE wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            Self::NotProcessed => "NOT_PROCESSED",
            Self::InvariantViolation => "INVARIANT_VIOLATION",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::DependencyError => "DEPENDENCY_ERROR",
        }
    }

    /// Returns true when a retry of the failed operation can plausibly succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted | Self::Timeout | Self::DependencyError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public error type carried by every fallible Viking operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct VikingError {
    pub code: ErrorCode,
    pub message: String,
}

/// Result alias used across Viking components.
pub type VikingResult<T> = Result<T, VikingError>;

impl VikingError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedFormat, message)
    }

    pub fn not_processed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotProcessed, message)
    }

    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvariantViolation, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceExhausted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DependencyError, message)
    }

    /// Prepends an operation label to the message, keeping the code.
    pub fn in_op(mut self, op: &str) -> Self {
        self.message = format!("{op}: {}", self.message);
        self
    }
}

impl From<std::io::Error> for VikingError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(error.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::already_exists(error.to_string()),
            std::io::ErrorKind::TimedOut => Self::timeout(error.to_string()),
            _ => Self::dependency(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for VikingError {
    fn from(error: serde_json::Error) -> Self {
        Self::dependency(format!("serialization error: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, VikingError};

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(ErrorCode::NotFound.as_str(), "NOT_FOUND");
        assert_eq!(ErrorCode::UnsupportedFormat.as_str(), "UNSUPPORTED_FORMAT");
        assert_eq!(ErrorCode::DependencyError.as_str(), "DEPENDENCY_ERROR");
        let encoded = serde_json::to_string(&ErrorCode::NotProcessed).expect("encode");
        assert_eq!(encoded, "\"NOT_PROCESSED\"");
    }

    #[test]
    fn io_error_mapping_preserves_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing node");
        let error = VikingError::from(io);
        assert_eq!(error.code, ErrorCode::NotFound);
    }

    #[test]
    fn transient_classification_covers_retryable_codes() {
        assert!(ErrorCode::Timeout.is_transient());
        assert!(ErrorCode::DependencyError.is_transient());
        assert!(!ErrorCode::InvalidArgument.is_transient());
        assert!(!ErrorCode::InvariantViolation.is_transient());
    }

    #[test]
    fn in_op_prefixes_message() {
        let error = VikingError::not_found("viking://resources/doc").in_op("abstract");
        assert_eq!(error.message, "abstract: viking://resources/doc");
        assert_eq!(error.code, ErrorCode::NotFound);
    }
}
