//! Session handles and the concurrency-safe session store.
//!
//! Each session is guarded by one reader-writer lock; the acquire flag used
//! for Run re-entrancy is a separate atomic so that a stuck writer cannot
//! block the in-progress check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

use super::state::AgentState;
use super::types::{Session, SessionId, SessionSnapshot};

/// Shared handle to one session.
pub struct SessionHandle {
    inner: RwLock<Session>,
    id: SessionId,
    acquired: AtomicBool,
}

impl SessionHandle {
    /// Wrap a session for shared use.
    pub fn new(session: Session) -> Arc<Self> {
        let id = session.id;
        Arc::new(Self {
            inner: RwLock::new(session),
            id,
            acquired: AtomicBool::new(false),
        })
    }

    /// The session id (stable, lock-free).
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Try to take the run-exclusivity flag. Returns false if a run is
    /// already in progress.
    pub fn try_acquire(&self) -> bool {
        self.acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the run-exclusivity flag.
    pub fn release(&self) {
        self.acquired.store(false, Ordering::Release);
    }

    /// Whether a run currently holds this session.
    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }

    /// Current state (read lock).
    pub async fn state(&self) -> AgentState {
        self.inner.read().await.state
    }

    /// Externally-visible snapshot.
    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::from(&*self.inner.read().await)
    }

    /// Perform a legal state transition, returning the canonical reason.
    ///
    /// The check and the update happen atomically under the write lock;
    /// concurrent callers on the same session are serialised.
    pub async fn transition(&self, target: AgentState) -> Result<&'static str> {
        let mut session = self.inner.write().await;
        let reason = session.state.check_transition(target)?;
        session.state = target;
        session.last_active = chrono::Utc::now();
        Ok(reason)
    }

    /// Force the session into ERROR from any non-terminal state.
    ///
    /// Used by Abort and by cancellation/timeout handling, which must be
    /// able to fail a session regardless of the phase graph. Terminal
    /// states stay sticky: returns false without touching them.
    pub async fn force_error(&self, detail: &str) -> bool {
        let mut session = self.inner.write().await;
        if session.state.is_terminal() {
            return false;
        }
        session.state = AgentState::Error;
        session.record_trace("abort", detail.to_string());
        session.last_active = chrono::Utc::now();
        true
    }

    /// Mutate the session under the write lock.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.inner.write().await;
        f(&mut session)
    }

    /// Read the session under the read lock.
    pub async fn read<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        let session = self.inner.read().await;
        f(&session)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

/// Concurrency-safe map of live sessions keyed by id.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, returning its shared handle.
    pub async fn insert(&self, session: Session) -> Arc<SessionHandle> {
        let handle = SessionHandle::new(session);
        self.sessions
            .write()
            .await
            .insert(handle.id(), Arc::clone(&handle));
        handle
    }

    /// Look up a session by id.
    pub async fn get(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Look up a session or fail with invalid input.
    pub async fn require(&self, id: SessionId) -> Result<Arc<SessionHandle>> {
        self.get(id)
            .await
            .ok_or_else(|| Error::invalid_input(format!("unknown session {id}")))
    }

    /// Explicitly evict a session. Fails if a run holds it.
    pub async fn evict(&self, id: SessionId) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&id) {
            None => Err(Error::invalid_input(format!("unknown session {id}"))),
            Some(handle) if handle.is_acquired() => {
                Err(Error::session_in_progress(id.to_string()))
            }
            Some(_) => {
                sessions.remove(&id);
                Ok(())
            }
        }
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::Session;

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let handle = SessionHandle::new(Session::new("/tmp/p"));
        assert!(handle.try_acquire());
        assert!(!handle.try_acquire());
        handle.release();
        assert!(handle.try_acquire());
    }

    #[tokio::test]
    async fn test_transition_updates_state() {
        let handle = SessionHandle::new(Session::new("/tmp/p"));
        let reason = handle.transition(AgentState::Init).await.unwrap();
        assert_eq!(reason, "run started");
        assert_eq!(handle.state().await, AgentState::Init);
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_state_unchanged() {
        let handle = SessionHandle::new(Session::new("/tmp/p"));
        let err = handle.transition(AgentState::Complete).await.unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
        assert_eq!(handle.state().await, AgentState::Idle);
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let handle = SessionHandle::new(Session::new("/tmp/p"));
        assert!(handle.force_error("abort requested").await);
        assert_eq!(handle.state().await, AgentState::Error);
        // Second force is a no-op on a terminal session.
        assert!(!handle.force_error("again").await);
        assert!(handle
            .transition(AgentState::Plan)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_store_insert_get_evict() {
        let store = SessionStore::new();
        let handle = store.insert(Session::new("/tmp/p")).await;
        let id = handle.id();
        assert!(store.get(id).await.is_some());
        assert_eq!(store.len().await, 1);

        handle.try_acquire();
        assert_eq!(
            store.evict(id).await.unwrap_err().code(),
            "session_in_progress"
        );
        handle.release();
        store.evict(id).await.unwrap();
        assert!(store.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_require_unknown_session() {
        let store = SessionStore::new();
        let err = store.require(SessionId::new()).await.unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }
}
