//! Server-side session records backing refresh tokens.
//!
//! One record per issued refresh token lineage step. Records are only ever
//! mutated to stamp `revoked_at`, and the first revocation reason wins.

pub mod id;
pub mod memory;

pub use id::SessionIdGenerator;
pub use memory::InMemorySessionStore;

use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why a session stopped being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    /// Superseded by a newer session on refresh
    Rotated,
    /// Explicit logout of this session
    Logout,
    /// "Log out everywhere" or an administrative revoke-all
    LogoutAll,
    /// Password was changed
    PasswordChange,
    /// A rotated refresh token was presented again
    ReplayDetected,
}

impl RevokeReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rotated => "rotated",
            Self::Logout => "logout",
            Self::LogoutAll => "logout_all",
            Self::PasswordChange => "password_change",
            Self::ReplayDetected => "replay_detected",
        }
    }
}

impl fmt::Display for RevokeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevokeReason {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rotated" => Ok(Self::Rotated),
            "logout" => Ok(Self::Logout),
            "logout_all" => Ok(Self::LogoutAll),
            "password_change" => Ok(Self::PasswordChange),
            "replay_detected" => Ok(Self::ReplayDetected),
            other => Err(AuthError::internal(format!("unknown revoke reason: {other}"))),
        }
    }
}

/// Lifecycle state of a session at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Rotated,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<RevokeReason>,
    /// Session that replaced this one on rotation.
    pub superseded_by: Option<String>,
}

impl SessionRecord {
    pub fn new(
        session_id: String,
        user_id: String,
        device_id: String,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        SessionRecord {
            session_id,
            user_id,
            device_id,
            issued_at,
            expires_at,
            revoked_at: None,
            revoke_reason: None,
            superseded_by: None,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> SessionState {
        match self.revoke_reason {
            Some(RevokeReason::Rotated) => SessionState::Rotated,
            Some(_) => SessionState::Revoked,
            None if self.revoked_at.is_some() => SessionState::Revoked,
            None if self.expires_at <= now => SessionState::Expired,
            None => SessionState::Active,
        }
    }

    /// The one revocation predicate every verification path goes through.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.state(now) == SessionState::Active
    }

    /// Stamp the revocation. Returns false if already revoked.
    pub fn revoke(&mut self, now: DateTime<Utc>, reason: RevokeReason) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        self.revoked_at = Some(now);
        self.revoke_reason = Some(reason);
        true
    }
}

/// Result of [`SessionStore::rotate`].
#[derive(Debug, Clone, PartialEq)]
pub enum RotateOutcome {
    /// Old session retired, here is its successor.
    Rotated(SessionRecord),
    /// The old session had already been rotated: the refresh token is being
    /// reused.
    Replayed,
    /// The old session was revoked for some other reason.
    Revoked,
    /// The old session ran out.
    Expired,
    /// No such session for this user/device.
    NotFound,
}

/// Persistent session table.
///
/// Implementations must make `rotate` a single atomic conditional update and
/// `create` all-or-nothing.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new active session.
    async fn create(&self, user_id: &str, device_id: &str) -> Result<SessionRecord, AuthError>;

    /// Fetch a record regardless of state.
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, AuthError>;

    /// True iff the record exists, is not revoked and has not expired.
    async fn is_active(&self, session_id: &str) -> Result<bool, AuthError>;

    /// Revoke one session. Idempotent; returns whether this call revoked it.
    async fn revoke(&self, session_id: &str, reason: RevokeReason) -> Result<bool, AuthError>;

    /// Revoke every active session of a user. Returns how many were revoked.
    async fn revoke_all(&self, user_id: &str, reason: RevokeReason) -> Result<u64, AuthError>;

    /// Revoke every active session of one user's device.
    async fn revoke_device(
        &self,
        user_id: &str,
        device_id: &str,
        reason: RevokeReason,
    ) -> Result<u64, AuthError>;

    /// Atomically retire `old_session_id` and create its successor.
    async fn rotate(
        &self,
        old_session_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<RotateOutcome, AuthError>;

    /// All records of a user, newest first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>, AuthError>;

    /// Hard-delete records that expired before `older_than`.
    async fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<u64, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(now: DateTime<Utc>) -> SessionRecord {
        SessionRecord::new(
            "s1".to_string(),
            "u1".to_string(),
            "d1".to_string(),
            now,
            now + Duration::days(7),
        )
    }

    #[test]
    fn test_state_transitions() {
        let now = Utc::now();
        let mut rec = record(now);
        assert_eq!(rec.state(now), SessionState::Active);
        assert_eq!(rec.state(now + Duration::days(7)), SessionState::Expired);

        assert!(rec.revoke(now, RevokeReason::Rotated));
        assert_eq!(rec.state(now), SessionState::Rotated);
        assert!(!rec.is_active(now));
    }

    #[test]
    fn test_first_revocation_wins() {
        let now = Utc::now();
        let mut rec = record(now);
        assert!(rec.revoke(now, RevokeReason::Logout));
        assert!(!rec.revoke(now + Duration::seconds(5), RevokeReason::Rotated));
        assert_eq!(rec.revoke_reason, Some(RevokeReason::Logout));
        assert_eq!(rec.revoked_at, Some(now));
        assert_eq!(rec.state(now), SessionState::Revoked);
    }

    #[test]
    fn test_revoke_reason_round_trips_through_str() {
        for reason in [
            RevokeReason::Rotated,
            RevokeReason::Logout,
            RevokeReason::LogoutAll,
            RevokeReason::PasswordChange,
            RevokeReason::ReplayDetected,
        ] {
            assert_eq!(reason.as_str().parse::<RevokeReason>().unwrap(), reason);
        }
        assert!("nope".parse::<RevokeReason>().is_err());
    }
}
