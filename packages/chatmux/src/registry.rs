//! Session Registry / Router
//!
//! Owns the shared connection and every live [`SessionController`]. Inbound
//! messages are routed by their `sessionId`; a message for a session that is
//! not registered is dropped.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::ids::SessionId;
use crate::protocol::ProtocolMessage;
use crate::session::{RunOptions, SessionController, SessionEvent};

pub struct SessionRegistry {
    connection: Arc<dyn Connection>,
    sessions: HashMap<SessionId, SessionController>,
    /// Registration order, used by broadcast.
    order: Vec<SessionId>,
}

impl SessionRegistry {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            sessions: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Build a controller on the shared connection and register it.
    pub fn create_session(
        &mut self,
        id: Option<SessionId>,
        options: RunOptions,
    ) -> &mut SessionController {
        let id = id.unwrap_or_else(SessionId::generate);
        let controller = SessionController::new(id, options, Arc::clone(&self.connection));
        self.insert(controller)
    }

    /// Register `controller`, replacing any session with the same id.
    pub fn register(&mut self, controller: SessionController) {
        self.insert(controller);
    }

    fn insert(&mut self, controller: SessionController) -> &mut SessionController {
        let id = controller.id().clone();
        match self.sessions.entry(id) {
            Entry::Occupied(mut entry) => {
                warn!(session_id = %entry.key(), "replacing registered session");
                entry.insert(controller);
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                debug!(session_id = %entry.key(), "session registered");
                self.order.push(entry.key().clone());
                entry.insert(controller)
            }
        }
    }

    pub fn unregister(&mut self, session_id: &SessionId) -> Option<SessionController> {
        let removed = self.sessions.remove(session_id)?;
        self.order.retain(|id| id != session_id);
        if removed.is_running() {
            info!(session_id = %session_id, "unregistered a session with a run in flight");
        }
        Some(removed)
    }

    pub fn dispatch(&mut self, message: &ProtocolMessage) -> Vec<SessionEvent> {
        let Some(session_id) = message.session_id() else {
            debug!(action = %message.action(), "unscoped message, not routed");
            return Vec::new();
        };
        match self.sessions.get_mut(session_id) {
            Some(session) => session.handle_event(message),
            None => {
                debug!(session_id = %session_id, action = %message.action(), "no session for message");
                Vec::new()
            }
        }
    }

    /// Start `prompt` on every idle session with a model, in registration order.
    pub fn broadcast_run(&mut self, prompt: &str) -> Vec<SessionId> {
        if prompt.trim().is_empty() {
            debug!("ignoring empty broadcast");
            return Vec::new();
        }

        let mut started = Vec::new();
        for id in &self.order {
            let Some(session) = self.sessions.get_mut(id) else {
                continue;
            };
            if session.is_running() || session.is_loading() || session.options().model.is_none() {
                debug!(session_id = %id, "skipping session in broadcast");
                continue;
            }
            let options = session.options().clone();
            match session.start_run(prompt, options) {
                Ok(_) => started.push(id.clone()),
                Err(err) => warn!(session_id = %id, error = %err, "broadcast run failed"),
            }
        }
        info!(started = started.len(), total = self.order.len(), "broadcast run");
        started
    }

    /// Returns whether a run was abandoned.
    pub fn reset(&mut self, session_id: &SessionId) -> bool {
        self.sessions
            .get_mut(session_id)
            .is_some_and(SessionController::reset)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&SessionController> {
        self.sessions.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &SessionId) -> Option<&mut SessionController> {
        self.sessions.get_mut(session_id)
    }

    pub fn session_ids(&self) -> &[SessionId] {
        &self.order
    }

    /// Sessions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &SessionController> {
        self.order.iter().filter_map(|id| self.sessions.get(id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
