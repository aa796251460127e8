//! Password hashing via bcrypt.
//!
//! Verification never distinguishes a malformed stored digest from a wrong
//! password; both come back as `false`.

use crate::error::AuthError;
use std::sync::Arc;
use tracing::debug;

/// Lowest cost bcrypt accepts.
pub const MIN_COST_FACTOR: u32 = 4;

/// Highest cost bcrypt accepts.
pub const MAX_COST_FACTOR: u32 = 31;

/// Why a verification did not succeed. Only visible inside the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerificationError {
    /// The stored digest is not a bcrypt hash.
    MalformedDigest,
}

/// Adaptive one-way hasher for stored secrets.
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    cost: u32,
    /// Digest at the configured cost, verified against when no user exists.
    dummy_digest: Arc<str>,
}

impl CredentialHasher {
    /// Create a hasher with the given bcrypt cost factor.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `cost` is outside
    /// [`MIN_COST_FACTOR`]..=[`MAX_COST_FACTOR`].
    pub fn new(cost: u32) -> Result<Self, AuthError> {
        if !(MIN_COST_FACTOR..=MAX_COST_FACTOR).contains(&cost) {
            return Err(AuthError::config(format!(
                "bcrypt cost must be within {}..={}, got {}",
                MIN_COST_FACTOR, MAX_COST_FACTOR, cost
            )));
        }
        let dummy_digest = bcrypt::hash("dummy-password-for-timing-equalisation", cost)
            .map_err(|e| AuthError::internal(format!("bcrypt hash: {e}")))?;
        Ok(Self {
            cost,
            dummy_digest: Arc::from(dummy_digest),
        })
    }

    /// Configured cost factor.
    #[must_use]
    pub const fn cost(&self) -> u32 {
        self.cost
    }

    /// Hash a secret. Every call embeds a fresh random salt.
    pub fn hash(&self, secret: &str) -> Result<String, AuthError> {
        bcrypt::hash(secret, self.cost).map_err(|e| AuthError::internal(format!("bcrypt hash: {e}")))
    }

    /// Verify a secret against a stored digest.
    #[must_use]
    pub fn verify(&self, secret: &str, digest: &str) -> bool {
        match self.try_verify(secret, digest) {
            Ok(matched) => matched,
            Err(VerificationError::MalformedDigest) => {
                debug!("stored digest is not a valid bcrypt hash");
                false
            }
        }
    }

    pub(crate) fn try_verify(&self, secret: &str, digest: &str) -> Result<bool, VerificationError> {
        bcrypt::verify(secret, digest).map_err(|_| VerificationError::MalformedDigest)
    }

    /// Burn the same CPU as a real verification. Used when there is no user
    /// record so that response time does not reveal whether an email exists.
    pub fn verify_dummy(&self, secret: &str) {
        let _ = self.verify(secret, &self.dummy_digest);
    }

    /// [`hash`](Self::hash) on the blocking thread pool.
    pub async fn hash_blocking(&self, secret: &str) -> Result<String, AuthError> {
        let hasher = self.clone();
        let secret = secret.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash(&secret))
            .await
            .map_err(|e| AuthError::internal(format!("hash task failed: {e}")))?
    }

    /// [`verify`](Self::verify) on the blocking thread pool.
    ///
    /// `digest == None` runs [`verify_dummy`](Self::verify_dummy) and always
    /// returns `false`.
    pub async fn verify_blocking(
        &self,
        secret: &str,
        digest: Option<&str>,
    ) -> Result<bool, AuthError> {
        let hasher = self.clone();
        let secret = secret.to_owned();
        let digest = digest.map(str::to_owned);
        tokio::task::spawn_blocking(move || match digest {
            Some(digest) => hasher.verify(&secret, &digest),
            None => {
                hasher.verify_dummy(&secret);
                false
            }
        })
        .await
        .map_err(|e| AuthError::internal(format!("verify task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hasher() -> CredentialHasher {
        CredentialHasher::new(MIN_COST_FACTOR).unwrap()
    }

    #[test]
    fn test_hash_is_salted() {
        let hasher = hasher();
        let a = hasher.hash("correct horse").unwrap();
        let b = hasher.hash("correct horse").unwrap();
        assert_ne!(a, b);
        assert!(hasher.verify("correct horse", &a));
        assert!(hasher.verify("correct horse", &b));
    }

    #[test]
    fn test_wrong_secret_does_not_verify() {
        let hasher = hasher();
        let digest = hasher.hash("right").unwrap();
        assert!(!hasher.verify("wrong", &digest));
    }

    #[test]
    fn test_malformed_digest_is_a_mismatch() {
        let hasher = hasher();
        assert!(!hasher.verify("anything", "not-a-bcrypt-hash"));
        assert!(!hasher.verify("anything", ""));
        assert_eq!(
            hasher.try_verify("anything", "$2b$xx$garbage"),
            Err(VerificationError::MalformedDigest)
        );
    }

    #[test]
    fn test_cost_bounds() {
        assert!(CredentialHasher::new(3).is_err());
        assert!(CredentialHasher::new(32).is_err());
        assert_eq!(CredentialHasher::new(10).unwrap().cost(), 10);
    }

    #[test]
    fn test_digest_embeds_cost() {
        let digest = CredentialHasher::new(5).unwrap().hash("pw").unwrap();
        assert!(digest.starts_with("$2b$05$"));
    }

    #[test]
    fn test_dummy_digest_is_ready_at_construction() {
        let hasher = CredentialHasher::new(5).unwrap();
        assert!(hasher.dummy_digest.starts_with("$2b$05$"));
        let before = Arc::clone(&hasher.dummy_digest);
        hasher.verify_dummy("whatever");
        assert!(Arc::ptr_eq(&before, &hasher.dummy_digest));
    }

    #[tokio::test]
    async fn test_blocking_variants() {
        let hasher = hasher();
        let digest = hasher.hash_blocking("pw").await.unwrap();
        assert!(hasher.verify_blocking("pw", Some(&digest)).await.unwrap());
        assert!(!hasher.verify_blocking("nope", Some(&digest)).await.unwrap());
        assert!(!hasher.verify_blocking("pw", None).await.unwrap());
    }
}
