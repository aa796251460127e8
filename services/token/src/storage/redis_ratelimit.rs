//! Attempt counters on Redis.
//!
//! Each counter is a hash `{start, count}` that expires with its window.

use super::to_millis;
use crate::error::AuthError;
use crate::ratelimit::{RateLimitStore, WindowState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;

// KEYS: counter
// ARGV: now, window
const INCREMENT_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local start = redis.call('HGET', KEYS[1], 'start')
if not start or now - tonumber(start) >= window then
  redis.call('HSET', KEYS[1], 'start', ARGV[1], 'count', 1)
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return {1, ARGV[1]}
end
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {count, start}
";

// KEYS: counter
// ARGV: now, window
const RELEASE_SCRIPT: &str = r"
local start = redis.call('HGET', KEYS[1], 'start')
if not start or tonumber(ARGV[1]) - tonumber(start) >= tonumber(ARGV[2]) then
  return 0
end
local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
if count > 0 then
  redis.call('HINCRBY', KEYS[1], 'count', -1)
end
return 1
";

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}

/// Rate limit counters shared by every service instance.
#[derive(Clone)]
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    increment_script: Arc<Script>,
    release_script: Arc<Script>,
}

impl RedisRateLimitStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment_script: Arc::new(Script::new(INCREMENT_SCRIPT)),
            release_script: Arc::new(Script::new(RELEASE_SCRIPT)),
        }
    }
}

fn window_state(count: i64, start: i64) -> Result<WindowState, AuthError> {
    Ok(WindowState {
        count: u32::try_from(count).unwrap_or(u32::MAX),
        window_start: super::from_millis(start)?,
    })
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowState, AuthError> {
        let mut conn = self.conn.clone();
        let (count, start): (i64, i64) = self
            .increment_script
            .key(key)
            .arg(to_millis(now))
            .arg(window_millis(window))
            .invoke_async(&mut conn)
            .await?;
        window_state(count, start)
    }

    async fn peek(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<WindowState>, AuthError> {
        let mut conn = self.conn.clone();
        let (start, count): (Option<i64>, Option<i64>) =
            conn.hget(key, &["start", "count"]).await?;
        match (start, count) {
            (Some(start), Some(count)) if to_millis(now) - start < window_millis(window) => {
                Ok(Some(window_state(count, start)?))
            }
            _ => Ok(None),
        }
    }

    async fn release(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(key)
            .arg(to_millis(now))
            .arg(window_millis(window))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), AuthError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
