//! Redis-backed stores.
//!
//! Multi-key updates run as Lua scripts so each store operation is a single
//! atomic step on the server.

pub mod redis_ratelimit;
pub mod redis_session;

pub use redis_ratelimit::RedisRateLimitStore;
pub use redis_session::RedisSessionStore;

use crate::error::AuthError;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::RedisError;
use rust_common::PlatformError;
use tracing::info;

/// Open a managed, auto-reconnecting connection.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, AuthError> {
    let client = redis::Client::open(redis_url)?;
    let conn = ConnectionManager::new(client).await?;
    info!("connected to redis");
    Ok(conn)
}

/// Classify a Redis failure as transient or permanent.
pub(crate) fn map_redis_error(err: &RedisError) -> PlatformError {
    if err.is_timeout() {
        PlatformError::timeout(err.to_string())
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        PlatformError::unavailable(err.to_string())
    } else {
        PlatformError::backend(err.to_string())
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, PlatformError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| PlatformError::corrupt_record(format!("timestamp out of range: {ms}")))
}
