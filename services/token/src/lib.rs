//! Token lifecycle library.
//!
//! Issues access/refresh token pairs bound to server-side sessions, rotates
//! refresh tokens with replay detection, revokes sessions and rate limits
//! credential checks.

#![forbid(unsafe_code)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod jwt;
pub mod metrics;
pub mod ratelimit;
pub mod service;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use config::Config;
pub use error::AuthError;
pub use service::{Identity, LoginRequest, TokenPair, TokenService};
