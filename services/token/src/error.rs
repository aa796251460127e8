//! Error taxonomy surfaced to the HTTP-facing collaborator.
//!
//! Display strings are deliberately terse: they name the error kind and never
//! whether an email exists or which check failed inside the codec.

use rust_common::PlatformError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the token lifecycle subsystem.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Wrong email or password. Never says which.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Too many attempts for this action/identifier.
    #[error("Rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited {
        /// Time left in the current window.
        retry_after: Duration,
    },

    /// Malformed token, bad signature, wrong kind or unsupported version.
    #[error("Invalid token")]
    InvalidToken,

    /// Signature valid but the token is past its expiry.
    #[error("Token expired")]
    ExpiredToken,

    /// The session behind the token was revoked or has expired.
    #[error("Session revoked")]
    SessionRevoked,

    /// A refresh token was presented after it had already been rotated.
    #[error("Refresh token reused - replay detected")]
    ReplayDetected,

    /// Credentials were correct but the account is disabled.
    #[error("Account disabled")]
    AccountDisabled,

    /// Backing store failure.
    #[error("Storage error: {0}")]
    Storage(#[from] PlatformError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub const AUTH_INVALID_CREDENTIALS: &str = "AUTH_INVALID_CREDENTIALS";
pub const AUTH_RATE_LIMITED: &str = "AUTH_RATE_LIMITED";
pub const TOKEN_INVALID: &str = "TOKEN_INVALID";
pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
pub const SESSION_REVOKED: &str = "SESSION_REVOKED";
pub const TOKEN_REFRESH_REUSED: &str = "TOKEN_REFRESH_REUSED";
pub const ACCOUNT_DISABLED: &str = "ACCOUNT_DISABLED";
pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

impl AuthError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code for the error kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => AUTH_INVALID_CREDENTIALS,
            Self::RateLimited { .. } => AUTH_RATE_LIMITED,
            Self::InvalidToken => TOKEN_INVALID,
            Self::ExpiredToken => TOKEN_EXPIRED,
            Self::SessionRevoked => SESSION_REVOKED,
            Self::ReplayDetected => TOKEN_REFRESH_REUSED,
            Self::AccountDisabled => ACCOUNT_DISABLED,
            Self::Storage(_) => STORAGE_ERROR,
            Self::Config(_) | Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// True when the caller did something wrong (401/403/429), false for
    /// server-side faults (5xx).
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Self::Storage(_) | Self::Config(_) | Self::Internal(_)
        )
    }

    /// True when the collaborator should force a full re-login rather than
    /// retrying with the same credentials.
    #[must_use]
    pub const fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::InvalidToken | Self::ExpiredToken | Self::SessionRevoked | Self::ReplayDetected
        )
    }
}

impl From<redis::RedisError> for AuthError {
    fn from(err: redis::RedisError) -> Self {
        AuthError::Storage(crate::storage::map_redis_error(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_for_client_errors() {
        let errors = [
            AuthError::InvalidCredentials,
            AuthError::RateLimited {
                retry_after: Duration::from_secs(10),
            },
            AuthError::InvalidToken,
            AuthError::ExpiredToken,
            AuthError::SessionRevoked,
            AuthError::ReplayDetected,
            AuthError::AccountDisabled,
        ];
        let mut codes: Vec<_> = errors.iter().map(AuthError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(errors.iter().all(AuthError::is_client_error));
    }

    #[test]
    fn test_storage_errors_are_server_side() {
        let err: AuthError = PlatformError::unavailable("redis").into();
        assert!(!err.is_client_error());
        assert_eq!(err.code(), STORAGE_ERROR);
    }

    #[test]
    fn test_invalid_credentials_message_is_generic() {
        let msg = AuthError::InvalidCredentials.to_string();
        assert!(!msg.to_lowercase().contains("email"));
        assert!(!msg.to_lowercase().contains("not found"));
    }

    #[test]
    fn test_rate_limited_display_includes_retry_after() {
        let err = AuthError::RateLimited {
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.to_string(), "Rate limited, retry after 42s");
    }

    #[test]
    fn test_reauthentication_kinds() {
        assert!(AuthError::ReplayDetected.requires_reauthentication());
        assert!(AuthError::SessionRevoked.requires_reauthentication());
        assert!(!AuthError::InvalidCredentials.requires_reauthentication());
    }
}
