use async_trait::async_trait;

use crate::error::{DoNotSend, RejectError};
use crate::message::Message;
use crate::session::SessionId;

/// Hooks through which user code participates in a session's life.
///
/// One application instance is shared by every session in the process and
/// is invoked concurrently from different session actors, so
/// implementations must be safe for that (interior mutability or
/// per-session state keyed by [`SessionId`]).
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Called once when the session is constructed.
    async fn on_create(&self, _session_id: &SessionId) {}

    /// Called when the session enters the logged-on state.
    async fn on_logon(&self, _session_id: &SessionId) {}

    /// Called when the session leaves the logged-on state, whether by
    /// logout exchange, disconnect, or session-window close.
    async fn on_logout(&self, _session_id: &SessionId) {}

    /// Last look at an outbound administrative message. The message may
    /// be mutated; it cannot be refused.
    async fn to_admin(&self, _msg: &mut Message, _session_id: &SessionId) {}

    /// Last look at an outbound application message. Returning
    /// [`DoNotSend`] drops it without consuming a sequence number.
    async fn to_app(&self, _msg: &mut Message, _session_id: &SessionId) -> Result<(), DoNotSend> {
        Ok(())
    }

    /// A valid inbound administrative message. An `Err` turns into a
    /// session-level Reject.
    async fn from_admin(
        &self,
        _msg: &Message,
        _session_id: &SessionId,
    ) -> Result<(), RejectError> {
        Ok(())
    }

    /// A valid inbound application message. An `Err` turns into a Reject
    /// or BusinessMessageReject depending on the reason and dialect.
    async fn from_app(&self, _msg: &Message, _session_id: &SessionId) -> Result<(), RejectError> {
        Ok(())
    }
}

/// An [`Application`] that accepts everything and does nothing.
pub struct NullApplication;

#[async_trait]
impl Application for NullApplication {}
