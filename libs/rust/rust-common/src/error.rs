//! Centralized error types for platform storage and I/O.
//!
//! Services wrap backing-store failures in [`PlatformError`] so that callers
//! can tell transient outages apart from permanent faults.

use thiserror::Error;

/// Common error type for platform operations.
///
/// All errors are classified as either retryable or non-retryable,
/// which helps callers decide whether to retry failed operations.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backing service is temporarily unavailable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Backing store rejected a command (bad script, wrong type, ...)
    #[error("Backend error: {0}")]
    Backend(String),

    /// A stored record could not be interpreted
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlatformError {
    /// Check if this error is retryable.
    ///
    /// Retryable errors are transient failures that may succeed on retry,
    /// such as network issues or temporary unavailability.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_common::PlatformError;
    ///
    /// let err = PlatformError::unavailable("redis down");
    /// assert!(err.is_retryable());
    ///
    /// let err = PlatformError::corrupt_record("session:abc");
    /// assert!(!err.is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Create an unavailable error with the given message.
    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a timeout error with the given message.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a backend error with the given message.
    #[must_use]
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a corrupt record error with the given message.
    #[must_use]
    pub fn corrupt_record(msg: impl Into<String>) -> Self {
        Self::CorruptRecord(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(PlatformError::unavailable("test").is_retryable());
        assert!(PlatformError::timeout("test").is_retryable());
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!PlatformError::backend("test").is_retryable());
        assert!(!PlatformError::corrupt_record("test").is_retryable());
        assert!(!PlatformError::Internal("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = PlatformError::unavailable("redis");
        assert_eq!(err.to_string(), "Service unavailable: redis");

        let err = PlatformError::corrupt_record("session:1");
        assert_eq!(err.to_string(), "Corrupt record: session:1");
    }

    #[test]
    fn test_serde_error_converts() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: PlatformError = parse.unwrap_err().into();
        assert!(matches!(err, PlatformError::Serialization(_)));
        assert!(!err.is_retryable());
    }
}
