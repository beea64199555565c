//! Process-wide map from session identity to live session handle.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use once_cell::sync::Lazy;

use crate::error::FixError;
use crate::message::Message;
use crate::protocol::tags;
use crate::session::{SessionHandle, SessionId};

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// Dispatches application sends to the session that owns the message's
/// CompID pair. Reads vastly outnumber writes, so a reader-preferring
/// `RwLock` guards the map.
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl Registry {
    /// A private registry, useful for tests and embedded setups.
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()) }
    }

    /// The process-wide registry, initialized lazily on first use.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    pub fn register(&self, handle: SessionHandle) -> crate::Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = handle.session_id().clone();
        if sessions.contains_key(&id) {
            return Err(FixError::DuplicateSessionId(id.to_string()));
        }
        sessions.insert(id, handle);
        Ok(())
    }

    pub fn unregister(&self, id: &SessionId) -> crate::Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| FixError::UnknownSession(id.to_string()))
    }

    pub fn lookup(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Route a message by its header `BeginString`, `SenderCompID`, and
    /// `TargetCompID`.
    pub fn send(&self, msg: Message) -> crate::Result<()> {
        let begin_string = msg.header.get_string(tags::BEGIN_STRING)?;
        let sender = msg.header.get_string(tags::SENDER_COMP_ID)?;
        let target = msg.header.get_string(tags::TARGET_COMP_ID)?;
        let id = SessionId::new(begin_string, sender, target);
        self.send_to_target(msg, &id)
    }

    /// Route a message to a known session, ignoring its header CompIDs.
    pub fn send_to_target(&self, msg: Message, id: &SessionId) -> crate::Result<()> {
        let handle = self
            .lookup(id)
            .ok_or_else(|| FixError::UnknownSession(id.to_string()))?;
        handle.send(msg)
    }

    /// Ask a session to drop back to a fresh sequence-number epoch.
    pub fn reset_session(&self, id: &SessionId) -> crate::Result<()> {
        let handle = self
            .lookup(id)
            .ok_or_else(|| FixError::UnknownSession(id.to_string()))?;
        handle.reset()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
