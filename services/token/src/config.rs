//! Centralized configuration for the token lifecycle service.
//!
//! All configuration is loaded from environment variables (a `.env` file is
//! honoured) and validated at startup.

use crate::credentials::{MAX_COST_FACTOR, MIN_COST_FACTOR};
use crate::error::AuthError;
use crate::ratelimit::RateLimitPolicy;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use zeroize::Zeroizing;

/// Minimum accepted HMAC secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Rate-limit action name used by login.
pub const LOGIN_ACTION: &str = "login";

/// Rate-limit action name used when a login supplies the client IP.
pub const LOGIN_IP_ACTION: &str = "login_ip";

/// Rate-limit action name used by password changes.
pub const CHANGE_PASSWORD_ACTION: &str = "change_password";

/// HMAC key for token signatures. Zeroed on drop, redacted in `Debug`.
#[derive(Clone)]
pub struct SigningSecret(Zeroizing<Vec<u8>>);

impl SigningSecret {
    /// Wrap raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for keys shorter than [`MIN_SECRET_LEN`].
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, AuthError> {
        let bytes = bytes.into();
        if bytes.len() < MIN_SECRET_LEN {
            return Err(AuthError::config(format!(
                "signing secret must be at least {} bytes, got {}",
                MIN_SECRET_LEN,
                bytes.len()
            )));
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    /// Generate a random 64-byte key (development only: tokens do not survive
    /// a restart).
    #[must_use]
    pub fn random() -> Self {
        use rand::RngCore;
        let mut key = vec![0u8; 64];
        rand::thread_rng().fill_bytes(&mut key);
        Self(Zeroizing::new(key))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(<redacted>)")
    }
}

/// What to revoke when a refresh token replay is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayRevocation {
    /// Every session the user holds.
    AllUserSessions,
    /// Only the sessions of the device the replayed token belonged to.
    DeviceSessions,
}

impl ReplayRevocation {
    /// Parse from `user` / `device`.
    pub fn parse(s: &str) -> Result<Self, AuthError> {
        match s.trim().to_lowercase().as_str() {
            "user" | "all" => Ok(Self::AllUserSessions),
            "device" => Ok(Self::DeviceSessions),
            other => Err(AuthError::config(format!(
                "Invalid REPLAY_REVOCATION: {}",
                other
            ))),
        }
    }
}

/// Token lifecycle configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // Token settings
    /// Access token TTL
    pub access_token_ttl: Duration,
    /// Refresh token (and session) TTL
    pub refresh_token_ttl: Duration,
    /// Claim schema version; tokens carrying any other version are rejected
    pub token_version: u32,
    /// HMAC signing secret
    pub signing_secret: SigningSecret,

    // Credential settings
    /// bcrypt cost factor
    pub hash_cost_factor: u32,

    // Rate limiting
    /// Per-action fixed-window policies
    pub rate_limits: HashMap<String, RateLimitPolicy>,

    // Session settings
    /// Scope of the defensive revocation after a replay
    pub replay_revocation: ReplayRevocation,
    /// How long expired session records are kept before purge
    pub session_retention: Duration,

    // Worker settings
    /// Redis connection URL
    pub redis_url: String,
    /// Period between retention sweeps
    pub retention_sweep_interval: Duration,

    // Logging
    /// Default log filter
    pub log_level: String,
    /// Emit JSON logs
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            access_token_ttl: Duration::from_secs(900),
            refresh_token_ttl: Duration::from_secs(604_800),
            token_version: 1,
            signing_secret: SigningSecret::random(),
            hash_cost_factor: bcrypt::DEFAULT_COST,
            rate_limits: default_rate_limits(),
            replay_revocation: ReplayRevocation::AllUserSessions,
            session_retention: Duration::from_secs(86_400),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            retention_sweep_interval: Duration::from_secs(3_600),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but invalid.
    pub fn from_env() -> Result<Self, AuthError> {
        dotenvy::dotenv().ok();

        let access_token_ttl = Duration::from_secs(parse_env("ACCESS_TOKEN_TTL", 900)?);
        let refresh_token_ttl = Duration::from_secs(parse_env("REFRESH_TOKEN_TTL", 604_800)?);
        let token_version = parse_env("TOKEN_VERSION", 1u32)?;
        let hash_cost_factor = parse_env("HASH_COST_FACTOR", bcrypt::DEFAULT_COST)?;

        let signing_secret = match env::var("TOKEN_SIGNING_SECRET") {
            Ok(secret) => SigningSecret::new(secret.into_bytes())?,
            Err(_) => {
                tracing::warn!("TOKEN_SIGNING_SECRET unset, using a random per-process key");
                SigningSecret::random()
            }
        };

        let rate_limits = match env::var("RATE_LIMITS") {
            Ok(spec) => parse_rate_limits(&spec)?,
            Err(_) => default_rate_limits(),
        };

        let replay_revocation = match env::var("REPLAY_REVOCATION") {
            Ok(v) => ReplayRevocation::parse(&v)?,
            Err(_) => ReplayRevocation::AllUserSessions,
        };
        let session_retention = Duration::from_secs(parse_env("SESSION_RETENTION", 86_400)?);

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let retention_sweep_interval =
            Duration::from_secs(parse_env("RETENTION_SWEEP_INTERVAL", 3_600)?);

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = parse_env("LOG_JSON", false)?;

        let config = Self {
            access_token_ttl,
            refresh_token_ttl,
            token_version,
            signing_secret,
            hash_cost_factor,
            rate_limits,
            replay_revocation,
            session_retention,
            redis_url,
            retention_sweep_interval,
            log_level,
            log_json,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first violation.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.access_token_ttl.is_zero() || self.refresh_token_ttl.is_zero() {
            return Err(AuthError::config("token TTLs must be non-zero"));
        }
        if self.access_token_ttl > self.refresh_token_ttl {
            return Err(AuthError::config(
                "ACCESS_TOKEN_TTL must not exceed REFRESH_TOKEN_TTL",
            ));
        }
        if !(MIN_COST_FACTOR..=MAX_COST_FACTOR).contains(&self.hash_cost_factor) {
            return Err(AuthError::config(format!(
                "HASH_COST_FACTOR must be within {}..={}, got {}",
                MIN_COST_FACTOR,
                MAX_COST_FACTOR,
                self.hash_cost_factor
            )));
        }
        Ok(())
    }

    /// Override the rate-limit policy for one action.
    #[must_use]
    pub fn with_rate_limit(mut self, action: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.rate_limits.insert(action.into(), policy);
        self
    }
}

fn default_rate_limits() -> HashMap<String, RateLimitPolicy> {
    let mut limits = HashMap::new();
    limits.insert(
        LOGIN_ACTION.to_string(),
        RateLimitPolicy::new(5, Duration::from_secs(15 * 60)),
    );
    limits
}

/// Parse `action=max/window_secs` pairs separated by commas, e.g.
/// `login=5/900,change_password=5/900`.
pub fn parse_rate_limits(spec: &str) -> Result<HashMap<String, RateLimitPolicy>, AuthError> {
    let mut limits = HashMap::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = || AuthError::config(format!("Invalid RATE_LIMITS entry: {}", entry));

        let (action, policy) = entry.split_once('=').ok_or_else(invalid)?;
        let (max, window) = policy.split_once('/').ok_or_else(invalid)?;
        let max_attempts: u32 = max.trim().parse().map_err(|_| invalid())?;
        let window_secs: u64 = window.trim().parse().map_err(|_| invalid())?;
        if max_attempts == 0 || window_secs == 0 {
            return Err(invalid());
        }

        limits.insert(
            action.trim().to_string(),
            RateLimitPolicy::new(max_attempts, Duration::from_secs(window_secs)),
        );
    }
    Ok(limits)
}

/// Parse environment variable with default value.
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, AuthError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .parse()
            .map_err(|e| AuthError::config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}
