//! Live-session registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::net::connection::ConnectionId;
use crate::session::Session;

/// Sessions that passed the handshake and have not been torn down yet.
///
/// All access goes through one mutex. The map holds no invariant a panic
/// could break halfway, so a poisoned lock is recovered.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: Mutex<HashMap<ConnectionId, Arc<Session>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the session was already registered.
    pub fn insert(&self, session: Arc<Session>) -> bool {
        let id = session.id();
        let inserted = self.lock().insert(id, session).is_none();
        tracing::debug!(connection_id = %id, "Session registered");
        inserted
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Session>> {
        let removed = self.lock().remove(&id);
        if removed.is_some() {
            tracing::debug!(connection_id = %id, "Session unregistered");
        }
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Point-in-time copy, ordered by connection ID.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
