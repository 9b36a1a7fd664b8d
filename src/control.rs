use std::collections::HashMap;
use std::sync::atomic::Ordering;

use crate::registry::SessionHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOutcome {
    /// The target is connected and now holds control.
    Granted,
    /// The target is offline; the grant is stored until it connects.
    Pending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    PendingCleared,
    NotFound,
}

/// Decides which client may send input.
///
/// Exactly one client, connected or pre-configured, may hold control at any
/// instant. Assigning control releases the previous holder (live session or
/// stored grant) before the new one gains it.
#[derive(Default)]
pub struct ControlArbitrator {
    controller: Option<String>,
    pending: HashMap<String, bool>,
}

impl ControlArbitrator {
    pub fn controller(&self) -> Option<&str> {
        self.controller.as_deref()
    }

    pub fn pending(&self) -> &HashMap<String, bool> {
        &self.pending
    }

    pub fn assign(
        &mut self,
        client_id: &str,
        sessions: &HashMap<String, SessionHandle>,
    ) -> AssignOutcome {
        self.clear_holder(sessions);
        if let Some(session) = sessions.get(client_id) {
            session.has_control.store(true, Ordering::Relaxed);
            self.controller = Some(client_id.to_string());
            AssignOutcome::Granted
        } else {
            self.pending.insert(client_id.to_string(), true);
            AssignOutcome::Pending
        }
    }

    pub fn release(
        &mut self,
        client_id: &str,
        sessions: &HashMap<String, SessionHandle>,
    ) -> ReleaseOutcome {
        if self.controller.as_deref() == Some(client_id) {
            if let Some(session) = sessions.get(client_id) {
                session.has_control.store(false, Ordering::Relaxed);
            }
            self.controller = None;
            ReleaseOutcome::Released
        } else if self.pending.remove(client_id).is_some() {
            ReleaseOutcome::PendingCleared
        } else {
            ReleaseOutcome::NotFound
        }
    }

    /// Consumes a stored grant when `client_id` connects. The session must
    /// already be present in `sessions`. Returns true when control was
    /// granted.
    pub fn connected(
        &mut self,
        client_id: &str,
        sessions: &HashMap<String, SessionHandle>,
    ) -> bool {
        match self.pending.remove(client_id) {
            Some(true) => {
                self.clear_holder(sessions);
                if let Some(session) = sessions.get(client_id) {
                    session.has_control.store(true, Ordering::Relaxed);
                }
                self.controller = Some(client_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Returns true when the disconnecting client held control. No other
    /// viewer is promoted.
    pub fn disconnected(&mut self, client_id: &str) -> bool {
        if self.controller.as_deref() == Some(client_id) {
            self.controller = None;
            true
        } else {
            false
        }
    }

    fn clear_holder(&mut self, sessions: &HashMap<String, SessionHandle>) {
        if let Some(previous) = self.controller.take() {
            if let Some(session) = sessions.get(&previous) {
                session.has_control.store(false, Ordering::Relaxed);
            }
        }
        self.pending.retain(|_, granted| !*granted);
    }
}
