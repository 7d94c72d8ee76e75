use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use serena_core::ids::{SessionId, SessionKey};
use serena_core::state::SessionState;

use crate::error::StoreError;

/// Held for the duration of one pipeline run or conversation turn.
pub type RunGuard = OwnedMutexGuard<()>;

struct SessionInner {
    key: SessionKey,
    state: RwLock<SessionState>,
    run_lock: Arc<Mutex<()>>,
    created_at: DateTime<Utc>,
}

/// Shared handle to one live session.
///
/// Clones point at the same state; a write through any clone is visible to
/// every other holder immediately.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("key", &self.inner.key)
            .field("keys", &self.inner.state.read().len())
            .finish()
    }
}

impl SessionHandle {
    fn new(key: SessionKey, initial: SessionState) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                key,
                state: RwLock::new(initial),
                run_lock: Arc::new(Mutex::new(())),
                created_at: Utc::now(),
            }),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.inner.key
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.key.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SessionState {
        self.inner.state.read().clone()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let _ = self.inner.state.write().insert(key, value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.state.write().remove(key)
    }

    /// Mutate the state under a single write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.inner.state.write();
        f(&mut state)
    }

    /// Wait for exclusive run access to this session.
    pub async fn lock_run(&self) -> RunGuard {
        self.inner.run_lock.clone().lock_owned().await
    }

    /// Claim run access without waiting; fails if another run holds it.
    pub fn try_lock_run(&self) -> Result<RunGuard, StoreError> {
        self.inner
            .run_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| StoreError::SessionBusy(self.inner.key.to_string()))
    }
}

/// Keyed conversation and pipeline state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session; fails with `Conflict` if the key already exists.
    async fn create(
        &self,
        key: SessionKey,
        initial_state: SessionState,
    ) -> Result<SessionHandle, StoreError>;

    /// Fails with `NotFound` when the session was never created.
    async fn get(&self, key: &SessionKey) -> Result<SessionHandle, StoreError>;

    /// Existing session, or a new one seeded with `initial_state`.
    async fn get_or_create(
        &self,
        key: SessionKey,
        initial_state: SessionState,
    ) -> Result<SessionHandle, StoreError>;

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Vec<SessionId>;

    /// State snapshot by key.
    async fn get_state(&self, key: &SessionKey) -> Result<SessionState, StoreError> {
        Ok(self.get(key).await?.state())
    }
}

/// Process-lifetime session store.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<SessionKey, SessionHandle>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    #[instrument(skip(self, initial_state), fields(session = %key))]
    async fn create(
        &self,
        key: SessionKey,
        initial_state: SessionState,
    ) -> Result<SessionHandle, StoreError> {
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!("session {key} already exists"))),
            Entry::Vacant(slot) => {
                debug!(seeded_keys = initial_state.len(), "session created");
                let handle = SessionHandle::new(key, initial_state);
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    async fn get(&self, key: &SessionKey) -> Result<SessionHandle, StoreError> {
        self.sessions
            .get(key)
            .map(|h| h.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("session {key}")))
    }

    async fn get_or_create(
        &self,
        key: SessionKey,
        initial_state: SessionState,
    ) -> Result<SessionHandle, StoreError> {
        let handle = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| SessionHandle::new(key, initial_state))
            .value()
            .clone();
        Ok(handle)
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| e.key().app_name == app_name && e.key().user_id == user_id)
            .map(|e| e.key().session_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(app: &str) -> SessionKey {
        SessionKey::new(app, "dev_user_01", SessionId::new())
    }

    #[tokio::test]
    async fn get_before_create_is_not_found() {
        let store = InMemorySessionStore::new();
        let err = store.get(&key("sql_pipeline_app")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_seeds_state() {
        let store = InMemorySessionStore::new();
        let k = key("visualization_app");
        let seed: SessionState = [("user_query", json!("sales by region"))].into_iter().collect();
        store.create(k.clone(), seed).await.unwrap();

        let state = store.get_state(&k).await.unwrap();
        assert_eq!(state.get_str("user_query"), Some("sales by region"));
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let store = InMemorySessionStore::new();
        let k = key("poster_app");
        store.create(k.clone(), SessionState::new()).await.unwrap();
        let err = store.create(k, SessionState::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn writes_are_visible_to_all_handles() {
        let store = InMemorySessionStore::new();
        let k = key("sql_pipeline_app");
        let a = store.create(k.clone(), SessionState::new()).await.unwrap();
        let b = store.get(&k).await.unwrap();

        a.set("query_generation_output", "SELECT 1");
        assert_eq!(b.get("query_generation_output"), Some(json!("SELECT 1")));
    }

    #[tokio::test]
    async fn sessions_with_different_keys_are_isolated() {
        let store = InMemorySessionStore::new();
        let a = store.create(key("sql_pipeline_app"), SessionState::new()).await.unwrap();
        let b = store.create(key("sql_pipeline_app"), SessionState::new()).await.unwrap();
        a.set("x", 1);
        assert!(b.get("x").is_none());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn get_or_create_returns_existing() {
        let store = InMemorySessionStore::new();
        let k = key("Serena Agent");
        let first = store.get_or_create(k.clone(), SessionState::new()).await.unwrap();
        first.set("history", json!([]));
        let second = store
            .get_or_create(k, [("history", json!(["ignored"]))].into_iter().collect())
            .await
            .unwrap();
        assert_eq!(second.get("history"), Some(json!([])));
    }

    #[tokio::test]
    async fn run_lock_is_exclusive() {
        let store = InMemorySessionStore::new();
        let handle = store.create(key("email_app"), SessionState::new()).await.unwrap();

        let guard = handle.try_lock_run().unwrap();
        assert!(matches!(handle.try_lock_run(), Err(StoreError::SessionBusy(_))));
        drop(guard);
        assert!(handle.try_lock_run().is_ok());
    }

    #[tokio::test]
    async fn list_sessions_filters_by_app_and_user() {
        let store = InMemorySessionStore::new();
        store.create(key("poster_app"), SessionState::new()).await.unwrap();
        store.create(key("poster_app"), SessionState::new()).await.unwrap();
        store.create(key("email_app"), SessionState::new()).await.unwrap();
        assert_eq!(store.list_sessions("poster_app", "dev_user_01").await.len(), 2);
        assert!(store.list_sessions("poster_app", "someone").await.is_empty());
    }
}
