use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::control::{AssignOutcome, ControlArbitrator, ReleaseOutcome};
use crate::errors::{RelayError, RelayResult};
use crate::events::RelayEvents;
use crate::models::{ClientEntry, PermissionEntry};
use crate::session::{close_code, CloseReason};

/// Backend chunks a slow viewer may have queued before it is disconnected.
const OUTBOUND_QUEUE_CHUNKS: usize = 1024;

/// Registry-side view of a live viewer connection.
pub struct SessionHandle {
    pub client_id: String,
    pub api_key: String,
    pub connection_id: Uuid,
    pub connected_at: DateTime<Utc>,
    pub has_control: Arc<AtomicBool>,
    pub authenticated: Arc<AtomicBool>,
    outbound: mpsc::Sender<Bytes>,
    close: mpsc::Sender<u16>,
}

impl SessionHandle {
    fn new(
        client_id: &str,
        api_key: &str,
        outbound: mpsc::Sender<Bytes>,
        close: mpsc::Sender<u16>,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            api_key: api_key.to_string(),
            connection_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            has_control: Arc::new(AtomicBool::new(false)),
            authenticated: Arc::new(AtomicBool::new(false)),
            outbound,
            close,
        }
    }

    fn try_send(&self, frame: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.outbound.try_send(frame)
    }

    /// Asks the session task to close the socket with the given code. The
    /// channel holds one pending code; later requests for an already-doomed
    /// session are dropped.
    fn request_close(&self, code: u16) {
        let _ = self.close.try_send(code);
    }

    #[cfg(test)]
    pub(crate) fn for_tests(client_id: &str) -> Self {
        let (outbound, _outbound_rx) = mpsc::channel(1);
        let (close, _close_rx) = mpsc::channel(1);
        let handle = Self::new(client_id, "test-key", outbound, close);
        // The receivers are dropped; sends simply fail, which is fine for
        // arbitration tests.
        handle
    }
}

/// Everything a session task needs to run one admitted connection.
pub struct Admission {
    pub connection_id: Uuid,
    pub has_control: Arc<AtomicBool>,
    pub authenticated: Arc<AtomicBool>,
    pub outbound: mpsc::Receiver<Bytes>,
    pub close: mpsc::Receiver<u16>,
}

#[derive(Clone, Debug)]
pub struct RegistrySnapshot {
    pub client_count: usize,
    pub controller: Option<String>,
    pub max_connections: usize,
}

struct RegistryInner {
    sessions: HashMap<String, SessionHandle>,
    api_keys: HashSet<String>,
    control: ControlArbitrator,
}

/// Tracks live viewer sessions, registered API keys and stored control
/// grants. All mutation happens under one lock so the single-controller
/// invariant holds across connect, disconnect and API calls.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    max_connections: usize,
    events: Arc<dyn RelayEvents>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, events: Arc<dyn RelayEvents>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                api_keys: HashSet::new(),
                control: ControlArbitrator::default(),
            })),
            max_connections,
            events,
        }
    }

    /// Registers an API key. Returns false when it was already present.
    pub async fn register_key(&self, api_key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.api_keys.insert(api_key.to_string())
    }

    /// Revokes an API key and force-disconnects every session using it.
    /// Returns the number of sessions closed.
    pub async fn revoke_key(&self, api_key: &str) -> RelayResult<usize> {
        let mut inner = self.inner.lock().await;
        if !inner.api_keys.remove(api_key) {
            return Err(RelayError::UnknownApiKey);
        }

        let doomed: Vec<String> = inner
            .sessions
            .values()
            .filter(|session| session.api_key == api_key)
            .map(|session| session.client_id.clone())
            .collect();

        for client_id in &doomed {
            if let Some(session) = inner.sessions.remove(client_id) {
                session.request_close(close_code::KEY_REVOKED);
                if inner.control.disconnected(client_id) {
                    self.events.controller_changed(None).await;
                }
                self.events.session_closed(client_id).await;
            }
        }
        Ok(doomed.len())
    }

    /// Admits a new viewer connection, consuming any stored control grant.
    /// A connection reusing a live clientId supersedes the old session.
    pub async fn admit(&self, client_id: &str, api_key: &str) -> Result<Admission, CloseReason> {
        let mut inner = self.inner.lock().await;
        if !inner.api_keys.contains(api_key) {
            return Err(CloseReason {
                code: close_code::INVALID_API_KEY,
                reason: "api key is not registered",
            });
        }

        let was_controller = inner.control.controller() == Some(client_id);
        if let Some(previous) = inner.sessions.remove(client_id) {
            previous.request_close(close_code::SUPERSEDED);
            self.events.session_closed(client_id).await;
        } else if inner.sessions.len() >= self.max_connections {
            return Err(CloseReason {
                code: close_code::CAPACITY_EXCEEDED,
                reason: "connection limit reached",
            });
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CHUNKS);
        let (close_tx, close_rx) = mpsc::channel(1);
        let handle = SessionHandle::new(client_id, api_key, outbound_tx, close_tx);
        let admission = Admission {
            connection_id: handle.connection_id,
            has_control: handle.has_control.clone(),
            authenticated: handle.authenticated.clone(),
            outbound: outbound_rx,
            close: close_rx,
        };
        inner.sessions.insert(client_id.to_string(), handle);

        let granted = if was_controller {
            // A reconnect under the same id keeps its control assignment.
            inner.sessions[client_id]
                .has_control
                .store(true, Ordering::Relaxed);
            false
        } else {
            let RegistryInner {
                control, sessions, ..
            } = &mut *inner;
            control.connected(client_id, sessions)
        };

        if granted {
            self.events.controller_changed(Some(client_id)).await;
        }
        self.events.session_opened(client_id).await;
        Ok(admission)
    }

    /// Removes a session at the end of its life. The connection id guards
    /// against a superseded session tearing down its replacement.
    pub async fn remove(&self, client_id: &str, connection_id: Uuid) {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .sessions
            .get(client_id)
            .map(|session| session.connection_id == connection_id)
            .unwrap_or(false);
        if !matches {
            return;
        }

        inner.sessions.remove(client_id);
        if inner.control.disconnected(client_id) {
            self.events.controller_changed(None).await;
        }
        self.events.session_closed(client_id).await;
    }

    /// Fans one backend chunk out to every authenticated session. A full
    /// queue means the viewer cannot keep up; it is disconnected rather than
    /// buffering without bound.
    pub async fn broadcast(&self, frame: Bytes) {
        let inner = self.inner.lock().await;
        for (client_id, session) in &inner.sessions {
            if !session.authenticated.load(Ordering::Relaxed) {
                continue;
            }
            match session.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(client = %client_id, "outbound queue full, disconnecting slow viewer");
                    session.request_close(close_code::QUEUE_OVERFLOW);
                }
                Err(TrySendError::Closed(_)) => {
                    // The session task is already tearing down.
                }
            }
        }
    }

    /// Closes every live session, e.g. when the backend connection dies.
    /// Stored grants survive; live control does not.
    pub async fn close_all(&self, code: u16) {
        let mut inner = self.inner.lock().await;
        let client_ids: Vec<String> = inner.sessions.keys().cloned().collect();
        for session in inner.sessions.values() {
            session.request_close(code);
        }
        inner.sessions.clear();
        let controller_lost = inner.control.controller().is_some();
        for client_id in &client_ids {
            inner.control.disconnected(client_id);
        }
        if controller_lost {
            self.events.controller_changed(None).await;
        }
        for client_id in &client_ids {
            self.events.session_closed(client_id).await;
        }
    }

    pub async fn assign_control(&self, client_id: &str) -> ClientEntry {
        let mut inner = self.inner.lock().await;
        let before = inner.control.controller().map(String::from);
        let outcome = {
            let RegistryInner {
                control, sessions, ..
            } = &mut *inner;
            control.assign(client_id, sessions)
        };
        let after = inner.control.controller().map(String::from);
        let entry = ClientEntry {
            client_id: client_id.to_string(),
            connected: outcome == AssignOutcome::Granted,
            has_control: true,
            connected_at: inner
                .sessions
                .get(client_id)
                .map(|session| session.connected_at),
        };
        drop(inner);

        if before != after {
            self.events.controller_changed(after.as_deref()).await;
        }
        entry
    }

    pub async fn release_control(&self, client_id: &str) -> RelayResult<ClientEntry> {
        let mut inner = self.inner.lock().await;
        let outcome = {
            let RegistryInner {
                control, sessions, ..
            } = &mut *inner;
            control.release(client_id, sessions)
        };
        let entry = ClientEntry {
            client_id: client_id.to_string(),
            connected: inner.sessions.contains_key(client_id),
            has_control: false,
            connected_at: inner
                .sessions
                .get(client_id)
                .map(|session| session.connected_at),
        };
        drop(inner);

        match outcome {
            ReleaseOutcome::Released => {
                self.events.controller_changed(None).await;
                Ok(entry)
            }
            ReleaseOutcome::PendingCleared => Ok(entry),
            ReleaseOutcome::NotFound => Err(RelayError::ControlNotFound(client_id.to_string())),
        }
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock().await;
        RegistrySnapshot {
            client_count: inner.sessions.len(),
            controller: inner.control.controller().map(String::from),
            max_connections: self.max_connections,
        }
    }

    /// Lists connected sessions plus clients that only exist as stored
    /// control grants.
    pub async fn list_clients(&self) -> Vec<ClientEntry> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<ClientEntry> = inner
            .sessions
            .values()
            .map(|session| ClientEntry {
                client_id: session.client_id.clone(),
                connected: true,
                has_control: session.has_control.load(Ordering::Relaxed),
                connected_at: Some(session.connected_at),
            })
            .collect();
        for (client_id, granted) in inner.control.pending() {
            if !inner.sessions.contains_key(client_id) {
                entries.push(ClientEntry {
                    client_id: client_id.clone(),
                    connected: false,
                    has_control: *granted,
                    connected_at: None,
                });
            }
        }
        entries.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        entries
    }

    pub async fn list_permissions(&self) -> Vec<PermissionEntry> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<PermissionEntry> = inner
            .control
            .pending()
            .iter()
            .map(|(client_id, granted)| PermissionEntry {
                client_id: client_id.clone(),
                has_control: *granted,
            })
            .collect();
        entries.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingEvents;

    fn registry(max_connections: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(max_connections, Arc::new(TracingEvents))
    }

    #[tokio::test]
    async fn admission_requires_a_registered_key() {
        let registry = registry(4);
        let err = registry.admit("a", "nope").await.err().unwrap();
        assert_eq!(err.code, close_code::INVALID_API_KEY);

        assert!(registry.register_key("k").await);
        assert!(!registry.register_key("k").await);
        assert!(registry.admit("a", "k").await.is_ok());
    }

    #[tokio::test]
    async fn admission_enforces_the_connection_cap() {
        let registry = registry(1);
        registry.register_key("k").await;
        let _first = registry.admit("a", "k").await.unwrap();
        let err = registry.admit("b", "k").await.err().unwrap();
        assert_eq!(err.code, close_code::CAPACITY_EXCEEDED);
    }

    #[tokio::test]
    async fn reconnect_supersedes_the_previous_session() {
        let registry = registry(1);
        registry.register_key("k").await;
        let mut first = registry.admit("a", "k").await.unwrap();
        // Same id again: replaces the old session instead of hitting the cap.
        let second = registry.admit("a", "k").await.unwrap();
        assert_eq!(first.close.recv().await, Some(close_code::SUPERSEDED));
        assert_ne!(first.connection_id, second.connection_id);
        assert_eq!(registry.snapshot().await.client_count, 1);

        // The stale task's removal must not tear down the replacement.
        registry.remove("a", first.connection_id).await;
        assert_eq!(registry.snapshot().await.client_count, 1);
        registry.remove("a", second.connection_id).await;
        assert_eq!(registry.snapshot().await.client_count, 0);
    }

    #[tokio::test]
    async fn revoking_a_key_disconnects_its_sessions() {
        let registry = registry(4);
        registry.register_key("k").await;
        registry.register_key("other").await;
        let mut doomed = registry.admit("a", "k").await.unwrap();
        let mut survivor = registry.admit("b", "other").await.unwrap();

        assert_eq!(registry.revoke_key("k").await.unwrap(), 1);
        assert_eq!(doomed.close.recv().await, Some(close_code::KEY_REVOKED));
        assert!(survivor.close.try_recv().is_err());
        assert_eq!(registry.snapshot().await.client_count, 1);

        let err = registry.admit("c", "k").await.err().unwrap();
        assert_eq!(err.code, close_code::INVALID_API_KEY);
        assert!(matches!(
            registry.revoke_key("k").await,
            Err(RelayError::UnknownApiKey)
        ));
    }

    #[tokio::test]
    async fn broadcast_reaches_only_authenticated_sessions() {
        let registry = registry(4);
        registry.register_key("k").await;
        let mut pending = registry.admit("pending", "k").await.unwrap();
        let mut ready = registry.admit("ready", "k").await.unwrap();
        ready.authenticated.store(true, Ordering::Relaxed);

        registry.broadcast(Bytes::from_static(b"frame")).await;
        assert_eq!(
            ready.outbound.recv().await.unwrap(),
            Bytes::from_static(b"frame")
        );
        assert!(pending.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflowing_viewers_are_disconnected() {
        let registry = registry(4);
        registry.register_key("k").await;
        let mut slow = registry.admit("slow", "k").await.unwrap();
        slow.authenticated.store(true, Ordering::Relaxed);

        for _ in 0..=OUTBOUND_QUEUE_CHUNKS {
            registry.broadcast(Bytes::from_static(b"x")).await;
        }
        assert_eq!(slow.close.recv().await, Some(close_code::QUEUE_OVERFLOW));
    }

    #[tokio::test]
    async fn stored_grant_is_applied_on_connect() {
        let registry = registry(4);
        registry.register_key("k").await;

        let entry = registry.assign_control("later").await;
        assert!(!entry.connected);
        assert!(entry.has_control);
        assert_eq!(registry.list_permissions().await.len(), 1);

        let admission = registry.admit("later", "k").await.unwrap();
        assert!(admission.has_control.load(Ordering::Relaxed));
        assert!(registry.list_permissions().await.is_empty());
        assert_eq!(
            registry.snapshot().await.controller.as_deref(),
            Some("later")
        );
    }

    #[tokio::test]
    async fn controller_disconnect_leaves_control_unassigned() {
        let registry = registry(4);
        registry.register_key("k").await;
        let a = registry.admit("a", "k").await.unwrap();
        let _b = registry.admit("b", "k").await.unwrap();

        registry.assign_control("a").await;
        registry.remove("a", a.connection_id).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.client_count, 1);
        assert_eq!(snapshot.controller, None);
    }

    #[tokio::test]
    async fn close_all_clears_sessions_but_keeps_grants() {
        let registry = registry(4);
        registry.register_key("k").await;
        let mut a = registry.admit("a", "k").await.unwrap();
        registry.assign_control("offline").await;

        registry.close_all(close_code::BACKEND_LOST).await;
        assert_eq!(a.close.recv().await, Some(close_code::BACKEND_LOST));
        assert_eq!(registry.snapshot().await.client_count, 0);
        assert_eq!(registry.list_permissions().await.len(), 1);
    }

    #[tokio::test]
    async fn client_listing_merges_sessions_and_grants() {
        let registry = registry(4);
        registry.register_key("k").await;
        let _a = registry.admit("a", "k").await.unwrap();
        registry.assign_control("a").await;
        registry.assign_control("z-offline").await;

        let clients = registry.list_clients().await;
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].client_id, "a");
        assert!(clients[0].connected);
        // Control moved to the stored grant, so the live session lost it.
        assert!(!clients[0].has_control);
        assert_eq!(clients[1].client_id, "z-offline");
        assert!(!clients[1].connected);
        assert!(clients[1].has_control);
    }
}
