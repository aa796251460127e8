use crate::config::SigningSecret;
use crate::error::AuthError;
use crate::jwt::claims::{Claims, TokenKind};
use crate::session::SessionIdGenerator;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rust_common::Clock;
use std::sync::Arc;
use tracing::debug;

/// Signs and parses bearer tokens with HS256.
///
/// Checks run in a fixed order: signature, expiry, version, kind. The
/// signature is verified before any claim is deserialized.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    version: u32,
    clock: Arc<dyn Clock>,
}

impl TokenCodec {
    pub fn new(secret: &SigningSecret, version: u32, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock instead.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.leeway = 0;

        TokenCodec {
            encoding_key: EncodingKey::from_secret(secret.expose()),
            decoding_key: DecodingKey::from_secret(secret.expose()),
            validation,
            version,
            clock,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Fresh claims for `kind` expiring at `expires_at`, stamped with the
    /// current time and version.
    pub fn claims(
        &self,
        kind: TokenKind,
        user_id: &str,
        device_id: &str,
        session_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Claims {
        Claims {
            sub: user_id.to_string(),
            did: device_id.to_string(),
            sid: session_id.to_string(),
            kind,
            ver: self.version,
            iat: self.clock.now().timestamp(),
            exp: expires_at.timestamp(),
            jti: SessionIdGenerator::generate_token_id(),
        }
    }

    pub fn encode(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::internal(format!("token encoding failed: {e}")))
    }

    /// Verify `token` and return its claims if it is a live token of
    /// `expected` kind.
    pub fn decode(&self, token: &str, expected: TokenKind) -> Result<Claims, AuthError> {
        self.decode_checked(token, expected, true)
    }

    /// As [`decode`](Self::decode) but accepts tokens past their expiry.
    /// Used where an expired token still proves ownership, e.g. logout.
    pub fn decode_allow_expired(&self, token: &str, expected: TokenKind) -> Result<Claims, AuthError> {
        self.decode_checked(token, expected, false)
    }

    fn decode_checked(
        &self,
        token: &str,
        expected: TokenKind,
        check_expiry: bool,
    ) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(error = ?e.kind(), "token rejected");
                AuthError::InvalidToken
            })?
            .claims;

        if check_expiry && claims.is_expired_at(self.clock.now().timestamp()) {
            return Err(AuthError::ExpiredToken);
        }
        if claims.ver != self.version {
            debug!(ver = claims.ver, expected = self.version, "token version mismatch");
            return Err(AuthError::InvalidToken);
        }
        if claims.kind != expected {
            debug!(kind = %claims.kind, expected = %expected, "token kind mismatch");
            return Err(AuthError::InvalidToken);
        }
        Ok(claims)
    }
}
