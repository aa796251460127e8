//! In-process attempt counters.

use super::{RateLimitStore, WindowState};
use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Entries beyond this count trigger a sweep of dead windows.
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: WindowState,
    window: Duration,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        let elapsed = (now - self.state.window_start).num_milliseconds();
        elapsed < i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Counter store backed by a mutex-guarded map. Increment-and-read happens
/// under one lock acquisition.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    counters: Mutex<HashMap<String, Entry>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked keys, live or not.
    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn increment(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowState, AuthError> {
        let mut counters = self.counters.lock();

        if counters.len() > SWEEP_THRESHOLD {
            counters.retain(|_, entry| entry.is_live(now));
        }

        let entry = counters.entry(key.to_string()).or_insert(Entry {
            state: WindowState {
                count: 0,
                window_start: now,
            },
            window,
        });

        if entry.state.count == 0 || !entry.is_live(now) {
            entry.state = WindowState {
                count: 1,
                window_start: now,
            };
            entry.window = window;
        } else {
            entry.state.count = entry.state.count.saturating_add(1);
        }

        Ok(entry.state)
    }

    async fn peek(
        &self,
        key: &str,
        _window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<WindowState>, AuthError> {
        let counters = self.counters.lock();
        Ok(counters
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.state))
    }

    async fn release(
        &self,
        key: &str,
        _window: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let mut counters = self.counters.lock();
        if let Some(entry) = counters.get_mut(key).filter(|entry| entry.is_live(now)) {
            entry.state.count = entry.state.count.saturating_sub(1);
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<(), AuthError> {
        self.counters.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_within_window() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        let first = store.increment("k", window, now).await.unwrap();
        let second = store
            .increment("k", window, now + chrono::Duration::seconds(10))
            .await
            .unwrap();

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(second.window_start, now);
    }

    #[tokio::test]
    async fn test_increment_after_window_starts_fresh() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        store.increment("k", window, now).await.unwrap();
        store.increment("k", window, now).await.unwrap();
        let later = now + chrono::Duration::seconds(61);
        let state = store.increment("k", window, later).await.unwrap();

        assert_eq!(state.count, 1);
        assert_eq!(state.window_start, later);
    }

    #[tokio::test]
    async fn test_peek_ignores_dead_windows() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        assert!(store.peek("k", window, now).await.unwrap().is_none());
        store.increment("k", window, now).await.unwrap();
        assert_eq!(store.peek("k", window, now).await.unwrap().unwrap().count, 1);

        let later = now + chrono::Duration::seconds(60);
        assert!(store.peek("k", window, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_keeps_window_start() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        store.release("k", window, now).await.unwrap();
        assert!(store.is_empty());

        store.increment("k", window, now).await.unwrap();
        store.increment("k", window, now).await.unwrap();
        let later = now + chrono::Duration::seconds(5);
        store.release("k", window, later).await.unwrap();
        let state = store.peek("k", window, later).await.unwrap().unwrap();
        assert_eq!(state.count, 1);
        assert_eq!(state.window_start, now);

        store.release("k", window, later).await.unwrap();
        store.release("k", window, later).await.unwrap();
        assert_eq!(store.increment("k", window, later).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_reset() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        store.increment("k", Duration::from_secs(60), now).await.unwrap();
        store.reset("k").await.unwrap();
        assert!(store.is_empty());
    }
}
