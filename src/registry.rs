use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::Serialize;
use uuid::Uuid;

use crate::relay::SessionLink;

/// One proxied client↔browser pairing.
pub struct Session {
    /// Opaque unique identifier.
    pub id: String,
    /// The browser-side WebSocket URL this session dialed.
    pub browser_ws_url: String,
    /// The path the client originally requested; kept for diagnostics.
    pub client_path: String,
    pub created_at: SystemTime,
    /// Cleared by the relay when teardown begins.
    pub active: AtomicBool,
    /// Socket handles and readiness state, shared with the relay and the
    /// plugin runtime.
    pub link: Arc<SessionLink>,
}

/// Registry counters reported by `stats`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryStats {
    pub active: usize,
    pub total: u64,
}

/// Tracks every live session by id.
///
/// Removal only unlinks a session; closing its sockets is the relay's
/// job.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    total_created: AtomicU64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            total_created: AtomicU64::new(0),
        }
    }

    /// Register a new session around an established link.
    pub fn create(
        &self,
        link: Arc<SessionLink>,
        browser_ws_url: impl Into<String>,
        client_path: impl Into<String>,
    ) -> Arc<Session> {
        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            browser_ws_url: browser_ws_url.into(),
            client_path: client_path.into(),
            created_at: SystemTime::now(),
            active: AtomicBool::new(true),
            link,
        });
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .insert(session.id.clone(), Arc::clone(&session));
        self.total_created.fetch_add(1, Ordering::Relaxed);
        session
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Unlink a session. Returns it if it was present.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .remove(id)
    }

    #[must_use]
    pub fn active(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|s| s.active.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self
                .sessions
                .lock()
                .expect("registry lock poisoned")
                .len(),
            total: self.total_created.load(Ordering::Relaxed),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(registry: &SessionRegistry) -> Arc<Session> {
        let (link, _receivers) = SessionLink::new();
        registry.create(link, "ws://localhost:1/devtools/browser/x", "/devtools/browser/x")
    }

    #[test]
    fn create_assigns_unique_ids() {
        let registry = SessionRegistry::new();
        let a = make_session(&registry);
        let b = make_session(&registry);
        assert_ne!(a.id, b.id);
        assert!(a.active.load(Ordering::SeqCst));
    }

    #[test]
    fn get_returns_registered_session() {
        let registry = SessionRegistry::new();
        let session = make_session(&registry);
        let found = registry.get(&session.id).unwrap();
        assert_eq!(found.id, session.id);
        assert!(registry.get("no-such-id").is_none());
    }

    #[test]
    fn remove_unlinks_without_touching_the_link() {
        let registry = SessionRegistry::new();
        let session = make_session(&registry);
        let removed = registry.remove(&session.id).unwrap();
        // Still marked active: removal does not close anything.
        assert!(removed.active.load(Ordering::SeqCst));
        assert!(registry.get(&session.id).is_none());
        assert!(registry.remove(&session.id).is_none());
    }

    #[test]
    fn stats_track_active_and_total() {
        let registry = SessionRegistry::new();
        let a = make_session(&registry);
        let _b = make_session(&registry);
        let stats = registry.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.total, 2);

        registry.remove(&a.id);
        let stats = registry.stats();
        assert_eq!(stats.active, 1);
        // Total is monotonic.
        assert_eq!(stats.total, 2);
    }

    #[test]
    fn active_excludes_deactivated_sessions() {
        let registry = SessionRegistry::new();
        let a = make_session(&registry);
        let _b = make_session(&registry);
        a.active.store(false, Ordering::SeqCst);
        let active = registry.active();
        assert_eq!(active.len(), 1);
        assert_ne!(active[0].id, a.id);
    }

    #[test]
    fn sessions_record_creation_metadata() {
        let registry = SessionRegistry::new();
        let session = make_session(&registry);
        assert_eq!(session.client_path, "/devtools/browser/x");
        assert!(session.created_at.elapsed().unwrap().as_secs() < 5);
    }
}
