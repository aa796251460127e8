use serde::{Deserialize, Serialize};
use std::fmt;

/// Which half of a token pair a token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim set carried by every bearer token.
///
/// The set is closed: unknown claims are ignored on decode and never
/// produced on encode. `ver` is bumped whenever this struct changes shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Device id, as supplied by the client at login
    pub did: String,
    /// Session the token is bound to
    pub sid: String,
    pub kind: TokenKind,
    /// Claim schema version
    pub ver: u32,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl Claims {
    pub fn is_expired_at(&self, timestamp: i64) -> bool {
        self.exp <= timestamp
    }
}
