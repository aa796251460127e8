//! In-process session table.
//!
//! Every mutation happens inside one write-lock critical section, which is
//! what makes `rotate` atomic here. The lock is never held across an await.

use super::{RevokeReason, RotateOutcome, SessionIdGenerator, SessionRecord, SessionState, SessionStore};
use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_common::Clock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<String, SessionRecord>,
    by_user: HashMap<String, HashSet<String>>,
}

impl Tables {
    fn insert(&mut self, record: SessionRecord) {
        self.by_user
            .entry(record.user_id.clone())
            .or_default()
            .insert(record.session_id.clone());
        self.sessions.insert(record.session_id.clone(), record);
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = SessionIdGenerator::generate();
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    fn revoke_matching<F>(&mut self, user_id: &str, now: DateTime<Utc>, reason: RevokeReason, filter: F) -> u64
    where
        F: Fn(&SessionRecord) -> bool,
    {
        let Some(ids) = self.by_user.get(user_id) else {
            return 0;
        };
        let mut count = 0;
        for id in ids {
            if let Some(record) = self.sessions.get_mut(id) {
                if record.is_active(now) && filter(record) && record.revoke(now, reason) {
                    count += 1;
                }
            }
        }
        count
    }
}

/// Session store held in memory. Suitable for tests and single-process
/// deployments.
pub struct InMemorySessionStore {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    session_ttl: chrono::Duration,
}

impl InMemorySessionStore {
    /// # Errors
    ///
    /// Returns a configuration error if `session_ttl` does not fit a
    /// `chrono::Duration`.
    pub fn new(clock: Arc<dyn Clock>, session_ttl: Duration) -> Result<Self, AuthError> {
        let session_ttl = chrono::Duration::from_std(session_ttl)
            .map_err(|e| AuthError::config(format!("session TTL out of range: {e}")))?;
        Ok(Self {
            tables: RwLock::new(Tables::default()),
            clock,
            session_ttl,
        })
    }

    /// Number of records held, in any state.
    pub fn len(&self) -> usize {
        self.tables.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, user_id: &str, device_id: &str) -> Result<SessionRecord, AuthError> {
        let now = self.clock.now();
        let mut tables = self.tables.write();
        let record = SessionRecord::new(
            tables.fresh_id(),
            user_id.to_string(),
            device_id.to_string(),
            now,
            now + self.session_ttl,
        );
        tables.insert(record.clone());
        Ok(record)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, AuthError> {
        Ok(self.tables.read().sessions.get(session_id).cloned())
    }

    async fn is_active(&self, session_id: &str) -> Result<bool, AuthError> {
        let now = self.clock.now();
        Ok(self
            .tables
            .read()
            .sessions
            .get(session_id)
            .is_some_and(|r| r.is_active(now)))
    }

    async fn revoke(&self, session_id: &str, reason: RevokeReason) -> Result<bool, AuthError> {
        let now = self.clock.now();
        let mut tables = self.tables.write();
        Ok(tables
            .sessions
            .get_mut(session_id)
            .is_some_and(|r| r.revoke(now, reason)))
    }

    async fn revoke_all(&self, user_id: &str, reason: RevokeReason) -> Result<u64, AuthError> {
        let now = self.clock.now();
        let count = self
            .tables
            .write()
            .revoke_matching(user_id, now, reason, |_| true);
        Ok(count)
    }

    async fn revoke_device(
        &self,
        user_id: &str,
        device_id: &str,
        reason: RevokeReason,
    ) -> Result<u64, AuthError> {
        let now = self.clock.now();
        let count = self
            .tables
            .write()
            .revoke_matching(user_id, now, reason, |r| r.device_id == device_id);
        Ok(count)
    }

    async fn rotate(
        &self,
        old_session_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> Result<RotateOutcome, AuthError> {
        let now = self.clock.now();
        let mut tables = self.tables.write();

        let state = match tables.sessions.get(old_session_id) {
            None => return Ok(RotateOutcome::NotFound),
            Some(old) if old.user_id != user_id || old.device_id != device_id => {
                warn!(session_id = %old_session_id, "session owner mismatch on rotate");
                return Ok(RotateOutcome::NotFound);
            }
            Some(old) => old.state(now),
        };

        match state {
            SessionState::Rotated => return Ok(RotateOutcome::Replayed),
            SessionState::Revoked => return Ok(RotateOutcome::Revoked),
            SessionState::Expired => return Ok(RotateOutcome::Expired),
            SessionState::Active => {}
        }

        let successor = SessionRecord::new(
            tables.fresh_id(),
            user_id.to_string(),
            device_id.to_string(),
            now,
            now + self.session_ttl,
        );
        if let Some(old) = tables.sessions.get_mut(old_session_id) {
            old.revoke(now, RevokeReason::Rotated);
            old.superseded_by = Some(successor.session_id.clone());
        }
        tables.insert(successor.clone());

        Ok(RotateOutcome::Rotated(successor))
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionRecord>, AuthError> {
        let tables = self.tables.read();
        let mut records: Vec<SessionRecord> = tables
            .by_user
            .get(user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.sessions.get(id).cloned())
            .collect();
        records.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(records)
    }

    async fn purge_expired(&self, older_than: DateTime<Utc>) -> Result<u64, AuthError> {
        let mut tables = self.tables.write();
        let doomed: Vec<(String, String)> = tables
            .sessions
            .values()
            .filter(|r| r.expires_at < older_than)
            .map(|r| (r.session_id.clone(), r.user_id.clone()))
            .collect();

        for (session_id, user_id) in &doomed {
            tables.sessions.remove(session_id);
            if let Some(ids) = tables.by_user.get_mut(user_id) {
                ids.remove(session_id);
                if ids.is_empty() {
                    tables.by_user.remove(user_id);
                }
            }
        }

        if !doomed.is_empty() {
            info!(count = doomed.len(), "purged expired sessions");
        }
        Ok(doomed.len() as u64)
    }
}
