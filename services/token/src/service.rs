//! Token service: issuance, verification, rotation and revocation.
//!
//! A session moves `Active -> Rotated | Revoked | Expired` and never back.
//! Every access check goes through [`SessionStore::is_active`], so a revoked
//! or rotated lineage stops working on the next request.

use crate::config::{
    Config, ReplayRevocation, CHANGE_PASSWORD_ACTION, LOGIN_ACTION, LOGIN_IP_ACTION,
};
use crate::credentials::{normalize_email, CredentialHasher, CredentialStore};
use crate::error::AuthError;
use crate::jwt::{TokenCodec, TokenKind};
use crate::metrics;
use crate::ratelimit::{InMemoryRateLimitStore, RateLimitStore, RateLimiter};
use crate::session::{
    InMemorySessionStore, RevokeReason, RotateOutcome, SessionRecord, SessionStore,
};
use chrono::{DateTime, Utc};
use rust_common::Clock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Credentials presented at login.
#[derive(Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub device_id: String,
    /// Caller address, rate limited separately when present.
    #[serde(default)]
    pub client_ip: Option<String>,
}

impl LoginRequest {
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        LoginRequest {
            email: email.into(),
            password: password.into(),
            device_id: device_id.into(),
            client_ip: None,
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("client_ip", &self.client_ip)
            .finish()
    }
}

/// Access + refresh token bound to one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub session_id: String,
    pub token_type: String,
}

/// Who a verified access token belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub device_id: String,
    pub session_id: String,
}

/// Orchestrates the token lifecycle over injected stores.
pub struct TokenService {
    codec: TokenCodec,
    hasher: CredentialHasher,
    limiter: RateLimiter,
    sessions: Arc<dyn SessionStore>,
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    access_ttl: chrono::Duration,
    replay_revocation: ReplayRevocation,
}

impl TokenService {
    /// # Errors
    ///
    /// Returns a configuration error if `config` does not validate.
    pub fn new(
        config: Config,
        sessions: Arc<dyn SessionStore>,
        credentials: Arc<dyn CredentialStore>,
        rate_limits: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        let access_ttl = chrono::Duration::from_std(config.access_token_ttl)
            .map_err(|e| AuthError::config(format!("access token TTL out of range: {e}")))?;

        Ok(TokenService {
            codec: TokenCodec::new(&config.signing_secret, config.token_version, clock.clone()),
            hasher: CredentialHasher::new(config.hash_cost_factor)?,
            limiter: RateLimiter::new(config.rate_limits, rate_limits, clock.clone()),
            sessions,
            credentials,
            clock,
            access_ttl,
            replay_revocation: config.replay_revocation,
        })
    }

    /// Service backed by in-process session and rate-limit stores.
    pub fn in_memory(
        config: Config,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        let sessions = Arc::new(InMemorySessionStore::new(
            clock.clone(),
            config.refresh_token_ttl,
        )?);
        Self::new(
            config,
            sessions,
            credentials,
            Arc::new(InMemoryRateLimitStore::new()),
            clock,
        )
    }

    pub fn hasher(&self) -> &CredentialHasher {
        &self.hasher
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    /// Authenticate and open a new session for the device.
    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    pub async fn login(&self, request: LoginRequest) -> Result<TokenPair, AuthError> {
        let started = Instant::now();
        let email = normalize_email(&request.email);

        if let Err(err) = self.admit_login(&email, request.client_ip.as_deref()).await {
            metrics::record_login_attempt("rate_limited");
            warn!("login rate limited");
            return Err(err);
        }

        let user = self
            .credentials
            .find_by_email(&email)
            .await?
            .filter(|user| !user.is_deleted());
        let matched = self
            .hasher
            .verify_blocking(&request.password, user.as_ref().map(|u| u.password_hash.as_str()))
            .await?;

        let user = match user {
            Some(user) if matched => user,
            _ => {
                // Already charged at admission.
                metrics::record_login_attempt("invalid_credentials");
                info!("login failed");
                return Err(AuthError::InvalidCredentials);
            }
        };

        self.limiter.record_attempt(LOGIN_ACTION, &email, true).await?;
        if let Some(ip) = request.client_ip.as_deref() {
            // The per-IP counter tracks failures only.
            self.limiter.release(LOGIN_IP_ACTION, ip).await?;
        }

        if user.disabled {
            metrics::record_login_attempt("account_disabled");
            info!(user_id = %user.user_id, "login refused, account disabled");
            return Err(AuthError::AccountDisabled);
        }

        let session = self.sessions.create(&user.user_id, &request.device_id).await?;
        let pair = self.issue_pair(&session)?;

        info!(
            user_id = %user.user_id,
            session_id = %session.session_id,
            "session opened"
        );
        metrics::record_login_attempt("success");
        metrics::record_token_issued("login");
        metrics::record_operation_latency("login", started.elapsed().as_secs_f64());
        Ok(pair)
    }

    /// Charge this attempt against the email and, when known, the client IP.
    /// An IP refusal hands the email attempt back.
    async fn admit_login(&self, email: &str, client_ip: Option<&str>) -> Result<(), AuthError> {
        self.limiter.admit(LOGIN_ACTION, email).await?;
        if let Some(ip) = client_ip {
            if let Err(err) = self.limiter.admit(LOGIN_IP_ACTION, ip).await {
                self.limiter.release(LOGIN_ACTION, email).await?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Verify an access token and that its session is still active.
    pub async fn verify_access(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.codec.decode(token, TokenKind::Access)?;
        if !self.sessions.is_active(&claims.sid).await? {
            return Err(AuthError::SessionRevoked);
        }
        Ok(Identity {
            user_id: claims.sub,
            device_id: claims.did,
            session_id: claims.sid,
        })
    }

    /// Signature, expiry, version and kind only. A revoked session keeps
    /// passing here until the access token expires.
    pub fn verify_access_stateless(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.codec.decode(token, TokenKind::Access)?;
        Ok(Identity {
            user_id: claims.sub,
            device_id: claims.did,
            session_id: claims.sid,
        })
    }

    /// Exchange a refresh token for a new pair, retiring the old session.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let started = Instant::now();
        let claims = match self.codec.decode(refresh_token, TokenKind::Refresh) {
            Ok(claims) => claims,
            Err(err) => {
                metrics::record_token_refreshed("invalid");
                return Err(err);
            }
        };

        let outcome = self.sessions.rotate(&claims.sid, &claims.sub, &claims.did).await?;
        let session = match outcome {
            RotateOutcome::Rotated(session) => session,
            RotateOutcome::Replayed => {
                return Err(self.handle_replay(&claims.sub, &claims.did, &claims.sid).await);
            }
            RotateOutcome::Revoked | RotateOutcome::Expired => {
                metrics::record_token_refreshed("revoked");
                return Err(AuthError::SessionRevoked);
            }
            RotateOutcome::NotFound => {
                metrics::record_token_refreshed("invalid");
                return Err(AuthError::InvalidToken);
            }
        };

        let pair = self.issue_pair(&session)?;
        info!(
            user_id = %claims.sub,
            old_session_id = %claims.sid,
            session_id = %session.session_id,
            "session rotated"
        );
        metrics::record_token_refreshed("success");
        metrics::record_token_issued("refresh");
        metrics::record_operation_latency("refresh", started.elapsed().as_secs_f64());
        Ok(pair)
    }

    async fn handle_replay(&self, user_id: &str, device_id: &str, session_id: &str) -> AuthError {
        warn!(
            user_id = %user_id,
            device_id = %device_id,
            session_id = %session_id,
            scope = ?self.replay_revocation,
            "refresh token replay detected, revoking sessions"
        );
        metrics::record_security_event("REFRESH_REPLAY");
        metrics::record_token_refreshed("replayed");

        let revoked = match self.replay_revocation {
            ReplayRevocation::AllUserSessions => {
                self.sessions
                    .revoke_all(user_id, RevokeReason::ReplayDetected)
                    .await
            }
            ReplayRevocation::DeviceSessions => {
                self.sessions
                    .revoke_device(user_id, device_id, RevokeReason::ReplayDetected)
                    .await
            }
        };

        match revoked {
            Ok(count) => {
                metrics::record_session_revoked(RevokeReason::ReplayDetected.as_str(), count);
                AuthError::ReplayDetected
            }
            Err(err) => err,
        }
    }

    /// End the session behind a refresh token. Expired tokens are accepted
    /// and repeated calls are no-ops.
    #[instrument(skip_all)]
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AuthError> {
        let claims = self
            .codec
            .decode_allow_expired(refresh_token, TokenKind::Refresh)?;
        if self.sessions.revoke(&claims.sid, RevokeReason::Logout).await? {
            info!(user_id = %claims.sub, session_id = %claims.sid, "session logged out");
            metrics::record_session_revoked(RevokeReason::Logout.as_str(), 1);
        }
        Ok(())
    }

    /// Replace the password after checking the old one, then revoke every
    /// session of the user. Returns how many sessions were revoked.
    #[instrument(skip(self, old_password, new_password))]
    pub async fn change_password(
        &self,
        user_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<u64, AuthError> {
        self.limiter.admit(CHANGE_PASSWORD_ACTION, user_id).await?;

        let user = self
            .credentials
            .find_by_id(user_id)
            .await?
            .filter(|user| !user.is_deleted());
        let matched = self
            .hasher
            .verify_blocking(old_password, user.as_ref().map(|u| u.password_hash.as_str()))
            .await?;

        let user = match user {
            Some(user) if matched => user,
            _ => return Err(AuthError::InvalidCredentials),
        };
        self.limiter
            .record_attempt(CHANGE_PASSWORD_ACTION, user_id, true)
            .await?;
        if user.disabled {
            return Err(AuthError::AccountDisabled);
        }

        let digest = self.hasher.hash_blocking(new_password).await?;
        self.credentials
            .update_password_hash(&user.user_id, &digest)
            .await?;

        let revoked = self
            .sessions
            .revoke_all(&user.user_id, RevokeReason::PasswordChange)
            .await?;
        info!(revoked, "password changed, sessions revoked");
        metrics::record_session_revoked(RevokeReason::PasswordChange.as_str(), revoked);
        Ok(revoked)
    }

    /// Log a user out everywhere.
    #[instrument(skip(self))]
    pub async fn revoke_all(&self, user_id: &str) -> Result<u64, AuthError> {
        let revoked = self
            .sessions
            .revoke_all(user_id, RevokeReason::LogoutAll)
            .await?;
        info!(revoked, "all sessions revoked");
        metrics::record_session_revoked(RevokeReason::LogoutAll.as_str(), revoked);
        Ok(revoked)
    }

    /// Session history of a user, newest first.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionRecord>, AuthError> {
        self.sessions.list_for_user(user_id).await
    }

    fn issue_pair(&self, session: &SessionRecord) -> Result<TokenPair, AuthError> {
        let now = self.clock.now();
        let access_expires_at = (now + self.access_ttl).min(session.expires_at);

        let access = self.codec.claims(
            TokenKind::Access,
            &session.user_id,
            &session.device_id,
            &session.session_id,
            access_expires_at,
        );
        let refresh = self.codec.claims(
            TokenKind::Refresh,
            &session.user_id,
            &session.device_id,
            &session.session_id,
            session.expires_at,
        );

        Ok(TokenPair {
            access_token: self.codec.encode(&access)?,
            refresh_token: self.codec.encode(&refresh)?,
            access_expires_at,
            refresh_expires_at: session.expires_at,
            session_id: session.session_id.clone(),
            token_type: "Bearer".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialRecord, InMemoryCredentialStore};
    use crate::ratelimit::RateLimitPolicy;
    use rust_common::ManualClock;
    use std::time::Duration;

    struct Fixture {
        service: TokenService,
        credentials: Arc<InMemoryCredentialStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(config: Config) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let hasher = CredentialHasher::new(config.hash_cost_factor).unwrap();
        credentials.insert(CredentialRecord::new(
            "user-1",
            "alice@example.com",
            hasher.hash("s3cret-pass").unwrap(),
        ));
        let service = TokenService::in_memory(config, credentials.clone(), clock.clone()).unwrap();
        Fixture {
            service,
            credentials,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Config {
            hash_cost_factor: 4,
            ..Config::default()
        })
    }

    fn login(email: &str, password: &str) -> LoginRequest {
        LoginRequest::new(email, password, "phone")
    }

    #[tokio::test]
    async fn test_login_then_verify() {
        let fx = fixture();
        let pair = fx
            .service
            .login(login("Alice@Example.com ", "s3cret-pass"))
            .await
            .unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert!(pair.access_expires_at < pair.refresh_expires_at);

        let identity = fx.service.verify_access(&pair.access_token).await.unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.device_id, "phone");
        assert_eq!(identity.session_id, pair.session_id);
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_email_look_the_same() {
        let fx = fixture();
        let wrong = fx
            .service
            .login(login("alice@example.com", "nope"))
            .await
            .unwrap_err();
        let unknown = fx
            .service
            .login(login("bob@example.com", "nope"))
            .await
            .unwrap_err();
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert!(matches!(unknown, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_disabled_and_deleted_accounts() {
        let fx = fixture();
        fx.credentials.set_disabled("user-1", true);
        assert!(matches!(
            fx.service.login(login("alice@example.com", "s3cret-pass")).await,
            Err(AuthError::AccountDisabled)
        ));
        assert!(matches!(
            fx.service.login(login("alice@example.com", "wrong")).await,
            Err(AuthError::InvalidCredentials)
        ));

        fx.credentials.set_disabled("user-1", false);
        fx.credentials.soft_delete("user-1", fx.clock.now());
        assert!(matches!(
            fx.service.login(login("alice@example.com", "s3cret-pass")).await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_replay_revokes_lineage() {
        let fx = fixture();
        let first = fx
            .service
            .login(login("alice@example.com", "s3cret-pass"))
            .await
            .unwrap();

        let second = fx.service.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(second.session_id, first.session_id);
        assert!(matches!(
            fx.service.verify_access(&first.access_token).await,
            Err(AuthError::SessionRevoked)
        ));
        fx.service.verify_access(&second.access_token).await.unwrap();

        assert!(matches!(
            fx.service.refresh(&first.refresh_token).await,
            Err(AuthError::ReplayDetected)
        ));
        assert!(matches!(
            fx.service.verify_access(&second.access_token).await,
            Err(AuthError::SessionRevoked)
        ));
        assert!(fx.service.refresh(&second.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_device_scoped_replay_spares_other_devices() {
        let fx = fixture_with(Config {
            hash_cost_factor: 4,
            replay_revocation: ReplayRevocation::DeviceSessions,
            ..Config::default()
        });
        let phone = fx
            .service
            .login(LoginRequest::new("alice@example.com", "s3cret-pass", "phone"))
            .await
            .unwrap();
        let laptop = fx
            .service
            .login(LoginRequest::new("alice@example.com", "s3cret-pass", "laptop"))
            .await
            .unwrap();

        fx.service.refresh(&phone.refresh_token).await.unwrap();
        assert!(matches!(
            fx.service.refresh(&phone.refresh_token).await,
            Err(AuthError::ReplayDetected)
        ));
        fx.service.verify_access(&laptop.access_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_logout_is_idempotent_and_accepts_expired_tokens() {
        let fx = fixture();
        let pair = fx
            .service
            .login(login("alice@example.com", "s3cret-pass"))
            .await
            .unwrap();

        fx.clock.advance(chrono::Duration::days(8));
        fx.service.logout(&pair.refresh_token).await.unwrap();
        fx.service.logout(&pair.refresh_token).await.unwrap();

        let sessions = fx.service.list_sessions("user-1").await.unwrap();
        assert_eq!(sessions[0].revoke_reason, Some(RevokeReason::Logout));

        assert!(matches!(
            fx.service.logout(&pair.access_token).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_logout_then_refresh_fails() {
        let fx = fixture();
        let pair = fx
            .service
            .login(login("alice@example.com", "s3cret-pass"))
            .await
            .unwrap();
        fx.service.logout(&pair.refresh_token).await.unwrap();
        assert!(matches!(
            fx.service.refresh(&pair.refresh_token).await,
            Err(AuthError::SessionRevoked)
        ));
    }

    #[tokio::test]
    async fn test_change_password_revokes_everything() {
        let fx = fixture();
        let a = fx
            .service
            .login(LoginRequest::new("alice@example.com", "s3cret-pass", "phone"))
            .await
            .unwrap();
        let b = fx
            .service
            .login(LoginRequest::new("alice@example.com", "s3cret-pass", "laptop"))
            .await
            .unwrap();

        assert!(matches!(
            fx.service.change_password("user-1", "wrong", "n3w-pass").await,
            Err(AuthError::InvalidCredentials)
        ));
        let revoked = fx
            .service
            .change_password("user-1", "s3cret-pass", "n3w-pass")
            .await
            .unwrap();
        assert_eq!(revoked, 2);

        assert!(fx.service.refresh(&a.refresh_token).await.is_err());
        assert!(fx.service.refresh(&b.refresh_token).await.is_err());
        assert!(fx
            .service
            .login(login("alice@example.com", "s3cret-pass"))
            .await
            .is_err());
        fx.service
            .login(login("alice@example.com", "n3w-pass"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_login_rate_limit() {
        let fx = fixture();
        for _ in 0..5 {
            assert!(matches!(
                fx.service.login(login("alice@example.com", "bad")).await,
                Err(AuthError::InvalidCredentials)
            ));
        }
        match fx.service.login(login("alice@example.com", "s3cret-pass")).await {
            Err(AuthError::RateLimited { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(900));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        fx.clock.advance(chrono::Duration::seconds(900));
        fx.service
            .login(login("alice@example.com", "s3cret-pass"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_ip_limit_spans_accounts() {
        let mut config = Config {
            hash_cost_factor: 4,
            ..Config::default()
        }
        .with_rate_limit(LOGIN_IP_ACTION, RateLimitPolicy::new(2, Duration::from_secs(60)));
        config.rate_limits.remove(LOGIN_ACTION);
        let fx = fixture_with(config);

        for email in ["a@example.com", "b@example.com"] {
            let req = LoginRequest::new(email, "x", "phone").with_client_ip("10.0.0.1");
            assert!(matches!(
                fx.service.login(req).await,
                Err(AuthError::InvalidCredentials)
            ));
        }
        let req = LoginRequest::new("alice@example.com", "s3cret-pass", "phone")
            .with_client_ip("10.0.0.1");
        assert!(matches!(
            fx.service.login(req).await,
            Err(AuthError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_stateless_verification_ignores_revocation() {
        let fx = fixture();
        let pair = fx
            .service
            .login(login("alice@example.com", "s3cret-pass"))
            .await
            .unwrap();
        assert_eq!(fx.service.revoke_all("user-1").await.unwrap(), 1);

        assert!(fx.service.verify_access(&pair.access_token).await.is_err());
        fx.service.verify_access_stateless(&pair.access_token).unwrap();
    }

    #[tokio::test]
    async fn test_successful_login_does_not_count_against_ip() {
        let config = Config {
            hash_cost_factor: 4,
            ..Config::default()
        }
        .with_rate_limit(LOGIN_IP_ACTION, RateLimitPolicy::new(2, Duration::from_secs(60)));
        let fx = fixture_with(config);

        for _ in 0..4 {
            let req = LoginRequest::new("alice@example.com", "s3cret-pass", "phone")
                .with_client_ip("10.0.0.9");
            fx.service.login(req).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_change_password_is_rate_limited() {
        let fx = fixture_with(
            Config {
                hash_cost_factor: 4,
                ..Config::default()
            }
            .with_rate_limit(CHANGE_PASSWORD_ACTION, RateLimitPolicy::new(2, Duration::from_secs(60))),
        );
        for _ in 0..2 {
            assert!(matches!(
                fx.service.change_password("user-1", "wrong", "n3w-pass").await,
                Err(AuthError::InvalidCredentials)
            ));
        }
        assert!(matches!(
            fx.service.change_password("user-1", "s3cret-pass", "n3w-pass").await,
            Err(AuthError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_login_request_debug_redacts_password() {
        let req = LoginRequest::new("a@b.c", "hunter2", "phone");
        assert!(!format!("{req:?}").contains("hunter2"));
    }
}
