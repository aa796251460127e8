//! Fixed-window attempt limiter for credential-checking actions.
//!
//! Counters are keyed by `(action, identifier)`. The identifier (an email or
//! an IP) is normalised and hashed before it reaches the store, so raw
//! addresses never become store keys.
//!
//! An attempt is charged when it is admitted ([`RateLimiter::acquire`]), in
//! the same atomic step that decides whether it may proceed. Concurrent
//! callers therefore each see a distinct count and at most `max_attempts`
//! get through per window.

pub mod memory;

pub use memory::InMemoryRateLimitStore;

use crate::error::AuthError;
use crate::metrics;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rust_common::Clock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempts allowed per window for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Failed attempts tolerated inside one window
    pub max_attempts: u32,
    /// Window length
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn new(max_attempts: u32, window: Duration) -> Self {
        RateLimitPolicy {
            max_attempts,
            window,
        }
    }

    fn window_millis(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Go ahead
    Allowed,
    /// Locked out until the current window ends
    Blocked { retry_after: Duration },
}

impl RateLimitDecision {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Counter state of one live window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub count: u32,
    pub window_start: DateTime<Utc>,
}

impl WindowState {
    fn elapsed_millis(&self, now: DateTime<Utc>) -> i64 {
        (now - self.window_start).num_milliseconds()
    }
}

/// Backing store for attempt counters.
///
/// `increment` must be atomic: concurrent callers on the same key never lose
/// an increment and each observes a distinct count.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one attempt, opening a fresh window when none is live.
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowState, AuthError>;

    /// Current live window, if any.
    async fn peek(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<WindowState>, AuthError>;

    /// Take back one attempt from the live window, if any. Never goes
    /// below zero and never moves the window start.
    async fn release(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError>;

    /// Drop the counter.
    async fn reset(&self, key: &str) -> Result<(), AuthError>;
}

/// Per-action fixed-window rate limiter.
pub struct RateLimiter {
    policies: HashMap<String, RateLimitPolicy>,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(
        policies: HashMap<String, RateLimitPolicy>,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        RateLimiter {
            policies,
            store,
            clock,
        }
    }

    /// Policy configured for `action`, if any.
    pub fn policy(&self, action: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(action)
    }

    /// Whether another attempt would be admitted right now, without charging
    /// one. Actions without a policy are never limited.
    pub async fn check(&self, action: &str, identifier: &str) -> Result<RateLimitDecision, AuthError> {
        let Some(policy) = self.policies.get(action) else {
            return Ok(RateLimitDecision::Allowed);
        };

        let now = self.clock.now();
        let key = counter_key(action, identifier);
        let Some(state) = self.store.peek(&key, policy.window, now).await? else {
            return Ok(RateLimitDecision::Allowed);
        };

        match blocked_for(policy, &state, now, policy.max_attempts) {
            Some(retry_after) => Ok(RateLimitDecision::Blocked { retry_after }),
            None => Ok(RateLimitDecision::Allowed),
        }
    }

    /// Charge one attempt and decide whether it may proceed.
    ///
    /// The increment and the comparison are a single store operation, so the
    /// n-th concurrent caller in a window observes count `n` and is refused
    /// once `n > max_attempts`. A refused attempt stays charged.
    pub async fn acquire(&self, action: &str, identifier: &str) -> Result<RateLimitDecision, AuthError> {
        let Some(policy) = self.policies.get(action) else {
            return Ok(RateLimitDecision::Allowed);
        };

        let now = self.clock.now();
        let key = counter_key(action, identifier);
        let state = self.store.increment(&key, policy.window, now).await?;

        let first_refused = policy.max_attempts.saturating_add(1);
        let Some(retry_after) = blocked_for(policy, &state, now, first_refused) else {
            return Ok(RateLimitDecision::Allowed);
        };

        if state.count == first_refused {
            warn!(
                action,
                max_attempts = policy.max_attempts,
                window_secs = policy.window.as_secs(),
                "attempt limit reached, locking out identifier"
            );
            metrics::record_security_event("RATE_LIMIT_LOCKOUT");
        }
        debug!(action, count = state.count, ?retry_after, "attempt blocked");
        metrics::record_rate_limited(action);
        Ok(RateLimitDecision::Blocked { retry_after })
    }

    /// [`acquire`](Self::acquire), mapping `Blocked` to [`AuthError::RateLimited`].
    pub async fn admit(&self, action: &str, identifier: &str) -> Result<(), AuthError> {
        match self.acquire(action, identifier).await? {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Blocked { retry_after } => {
                Err(AuthError::RateLimited { retry_after })
            }
        }
    }

    /// Hand back an attempt charged by [`acquire`](Self::acquire) that should
    /// not count, e.g. a success on a failures-only counter.
    pub async fn release(&self, action: &str, identifier: &str) -> Result<(), AuthError> {
        let Some(policy) = self.policies.get(action) else {
            return Ok(());
        };
        let key = counter_key(action, identifier);
        self.store.release(&key, policy.window, self.clock.now()).await
    }

    /// Record the outcome of an attempt that was not charged through
    /// [`acquire`](Self::acquire). Success clears the counter; failure counts
    /// against the window.
    pub async fn record_attempt(
        &self,
        action: &str,
        identifier: &str,
        success: bool,
    ) -> Result<(), AuthError> {
        let Some(policy) = self.policies.get(action) else {
            return Ok(());
        };
        let key = counter_key(action, identifier);

        if success {
            return self.store.reset(&key).await;
        }

        let state = self
            .store
            .increment(&key, policy.window, self.clock.now())
            .await?;
        if state.count == policy.max_attempts {
            warn!(
                action,
                max_attempts = policy.max_attempts,
                window_secs = policy.window.as_secs(),
                "attempt limit reached, locking out identifier"
            );
            metrics::record_security_event("RATE_LIMIT_LOCKOUT");
        }
        Ok(())
    }
}

/// Time left in the window when `state.count` has reached `limit`.
fn blocked_for(
    policy: &RateLimitPolicy,
    state: &WindowState,
    now: DateTime<Utc>,
    limit: u32,
) -> Option<Duration> {
    let remaining = policy.window_millis() - state.elapsed_millis(now);
    if state.count >= limit && remaining > 0 {
        Some(Duration::from_millis(u64::try_from(remaining).unwrap_or(0)))
    } else {
        None
    }
}

/// Store key for an action/identifier pair.
pub fn counter_key(action: &str, identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.trim().to_lowercase().as_bytes());
    format!("rl:{}:{}", action, URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_common::ManualClock;

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        let mut policies = HashMap::new();
        policies.insert(
            "login".to_string(),
            RateLimitPolicy::new(3, Duration::from_secs(60)),
        );
        RateLimiter::new(policies, Arc::new(InMemoryRateLimitStore::new()), clock)
    }

    #[test]
    fn test_counter_key_hides_identifier() {
        let key = counter_key("login", "User@Example.com");
        assert!(key.starts_with("rl:login:"));
        assert!(!key.contains("example"));
        assert_eq!(key, counter_key("login", " user@example.com "));
        assert_ne!(key, counter_key("login_ip", "user@example.com"));
    }

    #[tokio::test]
    async fn test_blocks_after_max_failures() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(clock.clone());

        for _ in 0..3 {
            assert!(limiter.check("login", "a@b.c").await.unwrap().is_allowed());
            limiter.record_attempt("login", "a@b.c", false).await.unwrap();
        }

        clock.advance(chrono::Duration::seconds(20));
        match limiter.check("login", "a@b.c").await.unwrap() {
            RateLimitDecision::Blocked { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(40));
            }
            RateLimitDecision::Allowed => panic!("expected lockout"),
        }

        // Other identifiers are unaffected.
        assert!(limiter.check("login", "x@y.z").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_window_expiry_lifts_block() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(clock.clone());

        for _ in 0..3 {
            limiter.record_attempt("login", "a@b.c", false).await.unwrap();
        }
        assert!(!limiter.check("login", "a@b.c").await.unwrap().is_allowed());

        clock.advance(chrono::Duration::seconds(60));
        assert!(limiter.check("login", "a@b.c").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(clock);

        limiter.record_attempt("login", "a@b.c", false).await.unwrap();
        limiter.record_attempt("login", "a@b.c", false).await.unwrap();
        limiter.record_attempt("login", "a@b.c", true).await.unwrap();
        limiter.record_attempt("login", "a@b.c", false).await.unwrap();
        limiter.record_attempt("login", "a@b.c", false).await.unwrap();

        assert!(limiter.check("login", "a@b.c").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_unconfigured_action_is_unlimited() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(clock);

        for _ in 0..50 {
            limiter.record_attempt("search", "a@b.c", false).await.unwrap();
        }
        assert!(limiter.check("search", "a@b.c").await.unwrap().is_allowed());
        assert!(limiter.policy("search").is_none());
    }

    #[tokio::test]
    async fn test_admit_maps_to_error() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(clock);
        for _ in 0..3 {
            limiter.admit("login", "a@b.c").await.unwrap();
        }
        let err = limiter.admit("login", "a@b.c").await.unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_acquire_charges_on_admission() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(clock.clone());

        for _ in 0..3 {
            assert!(limiter.acquire("login", "a@b.c").await.unwrap().is_allowed());
        }
        assert!(!limiter.check("login", "a@b.c").await.unwrap().is_allowed());

        clock.advance(chrono::Duration::seconds(15));
        match limiter.acquire("login", "a@b.c").await.unwrap() {
            RateLimitDecision::Blocked { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(45));
            }
            RateLimitDecision::Allowed => panic!("fourth attempt must be refused"),
        }

        clock.advance(chrono::Duration::seconds(45));
        assert!(limiter.acquire("login", "a@b.c").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_release_returns_one_attempt() {
        let clock = Arc::new(ManualClock::starting_now());
        let limiter = limiter(clock);

        limiter.acquire("login", "a@b.c").await.unwrap();
        limiter.acquire("login", "a@b.c").await.unwrap();
        limiter.acquire("login", "a@b.c").await.unwrap();
        limiter.release("login", "a@b.c").await.unwrap();
        assert!(limiter.acquire("login", "a@b.c").await.unwrap().is_allowed());
        assert!(!limiter.acquire("login", "a@b.c").await.unwrap().is_allowed());

        limiter.release("search", "a@b.c").await.unwrap();
    }
}
