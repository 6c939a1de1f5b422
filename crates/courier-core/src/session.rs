//! Per-user conversation sessions.
//!
//! A [`UserSession`] records which conversation state owns the user's next
//! input, plus scratch values accumulated across turns. The
//! [`SessionStore`] trait is the durability contract; backends are chosen at
//! wiring time.
//!
//! # Contract
//!
//! - `save` is idempotent and last-write-wins on `updated_at`: a record never
//!   replaces a stored record with a newer timestamp.
//! - Writes are atomic with respect to `get`.
//! - `cleanup_expired(t)` removes exactly the sessions with
//!   `now - updated_at > t`.
//! - An unreachable backend returns [`StoreError::Unavailable`]; it is never
//!   reported as a missing session.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::StoreResult;
use crate::event::{UserId, now_ms};

/// Scratch values accumulated across the turns of a conversation.
pub type ContextData = BTreeMap<String, Value>;

/// Persisted conversation state of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    /// Owner of the session.
    pub user_id: UserId,
    /// Tag of the state whose handler receives the next input.
    pub state: String,
    /// Scratch values.
    #[serde(default)]
    pub context: ContextData,
    /// Last write time in milliseconds since the Unix epoch.
    pub updated_at: u64,
}

impl UserSession {
    /// Creates a session in `state` with an empty context, stamped now.
    pub fn new(user_id: UserId, state: impl Into<String>) -> Self {
        Self {
            user_id,
            state: state.into(),
            context: ContextData::new(),
            updated_at: now_ms(),
        }
    }

    /// Replaces the context.
    pub fn with_context(mut self, context: ContextData) -> Self {
        self.context = context;
        self
    }

    /// Overrides the timestamp.
    pub fn updated_at(mut self, updated_at: u64) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Returns `true` if the session is older than `timeout` at `now`.
    pub fn is_expired_at(&self, now: u64, timeout: Duration) -> bool {
        now.saturating_sub(self.updated_at) > timeout.as_millis() as u64
    }
}

/// Durable or ephemeral mapping of user id to [`UserSession`].
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Stores a session, unless a newer record for the same user exists.
    async fn save(&self, session: &UserSession) -> StoreResult<()>;

    /// Loads the current session of a user.
    async fn get(&self, user_id: UserId) -> StoreResult<Option<UserSession>>;

    /// Removes the session of a user. Removing a missing session succeeds.
    async fn delete(&self, user_id: UserId) -> StoreResult<()>;

    /// Removes every session idle for longer than `timeout`; returns how many.
    async fn cleanup_expired(&self, timeout: Duration) -> StoreResult<u64>;

    /// Stores a session only if the stored record still carries
    /// `expected_updated_at` (`None` = no record may exist).
    ///
    /// Returns `false` when another writer got there first. This is the
    /// compare-and-swap used by deployments with several runtime instances.
    async fn save_if_unchanged(
        &self,
        session: &UserSession,
        expected_updated_at: Option<u64>,
    ) -> StoreResult<bool>;
}

// =============================================================================
// In-memory backend
// =============================================================================

/// Process-local [`SessionStore`] backed by a `HashMap`.
///
/// All operations run under one lock, so `cleanup_expired` never drops a
/// session that was renewed between its scan and its delete.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<UserId, UserSession>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns `true` if no session is stored.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &UserSession) -> StoreResult<()> {
        let mut sessions = self.sessions.write();
        match sessions.get(&session.user_id) {
            Some(existing) if existing.updated_at > session.updated_at => {
                debug!(
                    user_id = session.user_id,
                    stored = existing.updated_at,
                    incoming = session.updated_at,
                    "Ignoring stale session write"
                );
            }
            _ => {
                sessions.insert(session.user_id, session.clone());
            }
        }
        Ok(())
    }

    async fn get(&self, user_id: UserId) -> StoreResult<Option<UserSession>> {
        Ok(self.sessions.read().get(&user_id).cloned())
    }

    async fn delete(&self, user_id: UserId) -> StoreResult<()> {
        self.sessions.write().remove(&user_id);
        Ok(())
    }

    async fn cleanup_expired(&self, timeout: Duration) -> StoreResult<u64> {
        let now = now_ms();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now, timeout));
        Ok((before - sessions.len()) as u64)
    }

    async fn save_if_unchanged(
        &self,
        session: &UserSession,
        expected_updated_at: Option<u64>,
    ) -> StoreResult<bool> {
        let mut sessions = self.sessions.write();
        let current = sessions.get(&session.user_id).map(|s| s.updated_at);
        if current != expected_updated_at {
            return Ok(false);
        }
        sessions.insert(session.user_id, session.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user_id: UserId, state: &str, updated_at: u64) -> UserSession {
        UserSession::new(user_id, state).updated_at(updated_at)
    }

    #[tokio::test]
    async fn test_save_then_get_round_trips() {
        let store = MemorySessionStore::new();
        let mut context = ContextData::new();
        context.insert("name".into(), Value::from("Alice"));
        context.insert("age".into(), Value::from(30));
        let saved = UserSession::new(1, "AWAITING_AGE").with_context(context);

        store.save(&saved).await.unwrap();

        assert_eq!(store.get(1).await.unwrap(), Some(saved));
    }

    #[tokio::test]
    async fn test_save_is_last_write_wins() {
        let store = MemorySessionStore::new();
        store.save(&session(1, "NEW", 200)).await.unwrap();
        store.save(&session(1, "OLD", 100)).await.unwrap();

        assert_eq!(store.get(1).await.unwrap().unwrap().state, "NEW");

        store.save(&session(1, "NEWER", 300)).await.unwrap();
        assert_eq!(store.get(1).await.unwrap().unwrap().state, "NEWER");
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemorySessionStore::new();
        store.delete(42).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_exactly_expired() {
        let store = MemorySessionStore::new();
        let now = now_ms();
        store.save(&session(1, "A", now - 120_000)).await.unwrap();
        store.save(&session(2, "B", now - 90_000)).await.unwrap();
        store.save(&session(3, "C", now - 10_000)).await.unwrap();
        store.save(&session(4, "D", now)).await.unwrap();

        let removed = store
            .cleanup_expired(Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert!(store.get(1).await.unwrap().is_none());
        assert!(store.get(2).await.unwrap().is_none());
        assert!(store.get(3).await.unwrap().is_some());
        assert!(store.get(4).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_if_unchanged() {
        let store = MemorySessionStore::new();
        let first = session(1, "A", 100);

        assert!(store.save_if_unchanged(&first, None).await.unwrap());
        // A second creator loses.
        assert!(!store.save_if_unchanged(&first, None).await.unwrap());

        let second = session(1, "B", 200);
        assert!(!store.save_if_unchanged(&second, Some(99)).await.unwrap());
        assert!(store.save_if_unchanged(&second, Some(100)).await.unwrap());
        assert_eq!(store.get(1).await.unwrap().unwrap().state, "B");
    }

    #[test]
    fn test_expiry_is_strict() {
        let s = session(1, "A", 1_000);
        assert!(!s.is_expired_at(61_000, Duration::from_secs(60)));
        assert!(s.is_expired_at(61_001, Duration::from_secs(60)));
    }
}
