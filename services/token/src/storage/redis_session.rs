//! Session store on Redis.
//!
//! Layout:
//! - `session:{id}` hash with `user_id`, `device_id`, `issued_at`,
//!   `expires_at` and, once revoked, `revoked_at`, `revoke_reason`,
//!   `superseded_by`. Timestamps are epoch milliseconds.
//! - `user_sessions:{user_id}` set of that user's session ids.
//!
//! Session hashes carry a `PEXPIREAT` of `expires_at + retention`, so Redis
//! drops dead records on its own; `purge_expired` only has to tidy the
//! per-user index and anything written without a TTL.

use super::{from_millis, to_millis};
use crate::error::AuthError;
use crate::session::{
    RevokeReason, RotateOutcome, SessionIdGenerator, SessionRecord, SessionStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use rust_common::{Clock, PlatformError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const SESSION_PREFIX: &str = "session:";
const USER_SESSIONS_PREFIX: &str = "user_sessions:";

/// Fresh-id attempts before giving up on a collision.
const MAX_ID_ATTEMPTS: usize = 3;

const SCAN_BATCH: usize = 200;

// KEYS: session, user index
// ARGV: session_id, user_id, device_id, issued_at, expires_at, purge_at
const CREATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1],
  'user_id', ARGV[2], 'device_id', ARGV[3],
  'issued_at', ARGV[4], 'expires_at', ARGV[5])
redis.call('PEXPIREAT', KEYS[1], ARGV[6])
redis.call('SADD', KEYS[2], ARGV[1])
return 1
";

// KEYS: session
// ARGV: now, reason
const REVOKE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
if redis.call('HEXISTS', KEYS[1], 'revoked_at') == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'revoked_at', ARGV[1], 'revoke_reason', ARGV[2])
return 1
";

// KEYS: user index
// ARGV: now, reason, session key prefix, device_id ('' for every device)
const REVOKE_USER_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local count = 0
for _, id in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local key = ARGV[3] .. id
  local f = redis.call('HMGET', key, 'device_id', 'expires_at', 'revoked_at')
  if f[2] and not f[3] and tonumber(f[2]) > now
     and (ARGV[4] == '' or f[1] == ARGV[4]) then
    redis.call('HSET', key, 'revoked_at', ARGV[1], 'revoke_reason', ARGV[2])
    count = count + 1
  end
end
return count
";

// KEYS: old session, new session, user index
// ARGV: new_id, user_id, device_id, now, new_expires_at, purge_at
const ROTATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'not_found'
end
local f = redis.call('HMGET', KEYS[1],
  'user_id', 'device_id', 'expires_at', 'revoked_at', 'revoke_reason')
if f[1] ~= ARGV[2] or f[2] ~= ARGV[3] then
  return 'not_found'
end
if f[4] then
  if f[5] == 'rotated' then
    return 'replayed'
  end
  return 'revoked'
end
if tonumber(f[3]) <= tonumber(ARGV[4]) then
  return 'expired'
end
if redis.call('EXISTS', KEYS[2]) == 1 then
  return 'collision'
end
redis.call('HSET', KEYS[1],
  'revoked_at', ARGV[4], 'revoke_reason', 'rotated', 'superseded_by', ARGV[1])
redis.call('HSET', KEYS[2],
  'user_id', ARGV[2], 'device_id', ARGV[3],
  'issued_at', ARGV[4], 'expires_at', ARGV[5])
redis.call('PEXPIREAT', KEYS[2], ARGV[6])
redis.call('SADD', KEYS[3], ARGV[1])
return 'rotated'
";

fn session_key(session_id: &str) -> String {
    format!("{SESSION_PREFIX}{session_id}")
}

fn user_key(user_id: &str) -> String {
    format!("{USER_SESSIONS_PREFIX}{user_id}")
}

/// Session store persisting to Redis.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
    clock: Arc<dyn Clock>,
    session_ttl: chrono::Duration,
    retention: chrono::Duration,
    create_script: Arc<Script>,
    revoke_script: Arc<Script>,
    revoke_user_script: Arc<Script>,
    rotate_script: Arc<Script>,
}

impl RedisSessionStore {
    /// # Errors
    ///
    /// Returns a configuration error if either duration does not fit a
    /// `chrono::Duration`.
    pub fn new(
        conn: ConnectionManager,
        clock: Arc<dyn Clock>,
        session_ttl: Duration,
        retention: Duration,
    ) -> Result<Self, AuthError> {
        let to_chrono = |d: Duration, what: &str| {
            chrono::Duration::from_std(d)
                .map_err(|e| AuthError::config(format!("{what} out of range: {e}")))
        };
        Ok(Self {
            conn,
            clock,
            session_ttl: to_chrono(session_ttl, "session TTL")?,
            retention: to_chrono(retention, "session retention")?,
            create_script: Arc::new(Script::new(CREATE_SCRIPT)),
            revoke_script: Arc::new(Script::new(REVOKE_SCRIPT)),
            revoke_user_script: Arc::new(Script::new(REVOKE_USER_SCRIPT)),
            rotate_script: Arc::new(Script::new(ROTATE_SCRIPT)),
        })
    }

    fn purge_at(&self, expires_at: DateTime<Utc>) -> i64 {
        to_millis(expires_at + self.retention)
    }

    #[instrument(skip(self))]
    async fn revoke_for_user(
        &self,
        user_id: &str,
        device_id: &str,
        reason: RevokeReason,
    ) -> Result<u64, AuthError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .revoke_user_script
            .key(user_key(user_id))
            .arg(to_millis(self.clock.now()))
            .arg(reason.as_str())
            .arg(SESSION_PREFIX)
            .arg(device_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}

fn parse_record(session_id: &str, fields: HashMap<String, String>) -> Result<SessionRecord, PlatformError> {
    let corrupt = |field: &str| PlatformError::corrupt_record(format!("session {session_id}: {field}"));
    let text = |field: &str| fields.get(field).cloned().ok_or_else(|| corrupt(field));
    let millis = |field: &str| -> Result<Option<DateTime<Utc>>, PlatformError> {
        fields
            .get(field)
            .map(|v| v.parse::<i64>().map_err(|_| corrupt(field)).and_then(from_millis))
            .transpose()
    };

    let mut record = SessionRecord::new(
        session_id.to_string(),
        text("user_id")?,
        text("device_id")?,
        millis("issued_at")?.ok_or_else(|| corrupt("issued_at"))?,
        millis("expires_at")?.ok_or_else(|| corrupt("expires_at"))?,
    );
    record.revoked_at = millis("revoked_at")?;
    record.revoke_reason = fields
        .get("revoke_reason")
        .map(|r| r.parse::<RevokeReason>().map_err(|_| corrupt("revoke_reason")))
        .transpose()?;
    record.superseded_by = fields.get("superseded_by").cloned();
    Ok(record)
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    #[instrument(skip(self))]
    async fn create(&self, user_id: &str, device_id: &str) -> Result<SessionRecord, AuthError> {
        let mut conn = self.conn.clone();
        let now = self.clock.now();
        let expires_at = now + self.session_ttl;

        for _ in 0..MAX_ID_ATTEMPTS {
            let session_id = SessionIdGenerator::generate();
            let created: i64 = self
                .create_script
                .key(session_key(&session_id))
                .key(user_key(user_id))
                .arg(&session_id)
                .arg(user_id)
                .arg(device_id)
                .arg(to_millis(now))
                .arg(to_millis(expires_at))
                .arg(self.purge_at(expires_at))
                .invoke_async(&mut conn)
                .await?;
            if created == 1 {
                return Ok(SessionRecord::new(
                    session_id,
                    user_id.to_string(),
                    device_id.to_string(),
                    now,
                    expires_at,
                ));
            }
            warn!("session id collision on create");
        }
        Err(AuthError::internal("could not allocate a session id"))
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, AuthError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(session_key(session_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_record(session_id, fields)?))
    }

    async fn is_active(&self, session_id: &str) -> Result<bool, AuthError> {
        let now = self.clock.now();
        Ok(self
            .get(session_id)
            .await?
            .is_some_and(|r| r.is_active(now)))
    }

    #[instrument(skip(self))]
    async fn revoke(&self, session_id: &str, reason: RevokeReason) -> Result<bool, AuthError> {
        let mut conn = self.conn.clone();
        let revoked: i64 = self
            .revoke_script
            .key(session_key(session_id))
            .arg(to_millis(self.clock.now()))
            .arg(reason.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(revoked == 1)
    }

    async fn revoke_all(&self, user_id: &str, reason: RevokeReason) -> Result<u64, AuthError> {
        self.revoke_for_user(user_id, "", reason).await
    }

    async fn revoke_device(
        &self,
        user_id: &str,
        device_id: &str,
        reason: RevokeReason,
    ) -> Result<u64, AuthError> {
        if device_id.is_empty() {
            return Ok(0);
        }
        self.revoke_for_user(user_id, device_id, reason).await
    }

    #[instrument(skip(self))]
    async fn rotate(
        &self,
        old_session_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<RotateOutcome, AuthError> {
        let mut conn = self.conn.clone();
        let now = self.clock.now();
        let expires_at = now + self.session_ttl;

        for _ in 0..MAX_ID_ATTEMPTS {
            let new_id = SessionIdGenerator::generate();
            let status: String = self
                .rotate_script
                .key(session_key(old_session_id))
                .key(session_key(&new_id))
                .key(user_key(user_id))
                .arg(&new_id)
                .arg(user_id)
                .arg(device_id)
                .arg(to_millis(now))
                .arg(to_millis(expires_at))
                .arg(self.purge_at(expires_at))
                .invoke_async(&mut conn)
                .await?;

            let outcome = match status.as_str() {
                "rotated" => RotateOutcome::Rotated(SessionRecord::new(
                    new_id,
                    user_id.to_string(),
                    device_id.to_string(),
                    now,
                    expires_at,
                )),
                "replayed" => RotateOutcome::Replayed,
                "revoked" => RotateOutcome::Revoked,
                "expired" => RotateOutcome::Expired,
                "not_found" => RotateOutcome::NotFound,
                "collision" => {
                    warn!("session id collision on rotate");
                    continue;
                }
                other => {
                    return Err(PlatformError::backend(format!("unexpected rotate status: {other}")).into())
                }
            };
            debug!(status = %status, "rotate finished");
            return Ok(outcome);
        }
        Err(AuthError::internal("could not allocate a session id"))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>, AuthError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(user_key(user_id)).await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&id).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{USER_SESSIONS_PREFIX}*");
        let mut user_keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            user_keys.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let cutoff = to_millis(older_than);
        let mut purged = 0u64;
        for index in user_keys {
            let ids: Vec<String> = conn.smembers(&index).await?;
            for id in ids {
                let key = session_key(&id);
                let expires_at: Option<i64> = conn.hget(&key, "expires_at").await?;
                match expires_at {
                    Some(at) if at >= cutoff => continue,
                    Some(_) => {
                        conn.del::<_, ()>(&key).await?;
                        purged += 1;
                    }
                    // Already dropped by its TTL
                    None => {}
                }
                conn.srem::<_, _, ()>(&index, &id).await?;
            }
        }

        if purged > 0 {
            info!(count = purged, "purged expired sessions");
        }
        Ok(purged)
    }
}
