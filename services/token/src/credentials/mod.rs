//! Credential records and password hashing.
//!
//! User records belong to the user-management collaborator; this subsystem
//! reads them through [`CredentialStore`] and only ever writes a new password
//! hash.

pub mod hasher;

pub use hasher::{CredentialHasher, MAX_COST_FACTOR, MIN_COST_FACTOR};

use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A user as far as authentication is concerned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialRecord {
    pub user_id: String,
    pub email: String,
    pub password_hash: String,
    pub disabled: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn new(
        user_id: impl Into<String>,
        email: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        CredentialRecord {
            user_id: user_id.into(),
            email: email.into(),
            password_hash: password_hash.into(),
            disabled: false,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Read access to user credentials, implemented by the user-management layer.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look a user up by (case-insensitive) email.
    async fn find_by_email(&self, email: &str) -> Result<Option<CredentialRecord>, AuthError>;

    /// Look a user up by id.
    async fn find_by_id(&self, user_id: &str) -> Result<Option<CredentialRecord>, AuthError>;

    /// Persist a new password hash.
    async fn update_password_hash(&self, user_id: &str, password_hash: &str)
        -> Result<(), AuthError>;
}

/// Lower-case and trim an email for lookups and rate-limit keys.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// In-process credential store for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    users: RwLock<HashMap<String, CredentialRecord>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user.
    pub fn insert(&self, record: CredentialRecord) {
        self.users.write().insert(record.user_id.clone(), record);
    }

    /// Flip the disabled flag. Returns false if the user does not exist.
    pub fn set_disabled(&self, user_id: &str, disabled: bool) -> bool {
        match self.users.write().get_mut(user_id) {
            Some(record) => {
                record.disabled = disabled;
                true
            }
            None => false,
        }
    }

    /// Soft-delete a user. Returns false if the user does not exist.
    pub fn soft_delete(&self, user_id: &str, at: DateTime<Utc>) -> bool {
        match self.users.write().get_mut(user_id) {
            Some(record) => {
                record.deleted_at = Some(at);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<CredentialRecord>, AuthError> {
        let email = normalize_email(email);
        Ok(self
            .users
            .read()
            .values()
            .find(|r| normalize_email(&r.email) == email)
            .cloned())
    }

    async fn find_by_id(&self, user_id: &str) -> Result<Option<CredentialRecord>, AuthError> {
        Ok(self.users.read().get(user_id).cloned())
    }

    async fn update_password_hash(
        &self,
        user_id: &str,
        password_hash: &str,
    ) -> Result<(), AuthError> {
        let mut users = self.users.write();
        let record = users
            .get_mut(user_id)
            .ok_or(AuthError::InvalidCredentials)?;
        record.password_hash = password_hash.to_string();
        Ok(())
    }
}
