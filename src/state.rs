//! Session lifecycle state and the inputs a session actor consumes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::message::Message;

/// State wrapped by [`SessionState::PendingTimeout`] while a TestRequest
/// is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingInner {
    InSession,
    Resend,
}

/// Lifecycle of one FIX session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Idle: no transport attached, nothing in flight.
    Latent,
    /// Connected; logon exchange in progress.
    Logon,
    /// We sent Logout and are waiting for the peer's acknowledgment.
    Logout,
    /// Logged on, sequence numbers in step.
    InSession,
    /// Logged on, recovering an inbound gap via ResendRequest.
    Resend,
    /// Logged on but the peer has gone quiet; a TestRequest is pending.
    PendingTimeout(PendingInner),
    /// Outside the configured session window.
    NotSessionTime,
}

impl SessionState {
    pub fn is_logged_on(self) -> bool {
        matches!(
            self,
            SessionState::InSession | SessionState::Resend | SessionState::PendingTimeout(_)
        )
    }

    pub fn is_session_time(self) -> bool {
        !matches!(self, SessionState::NotSessionTime)
    }

    /// A transport is attached.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Logon
                | SessionState::Logout
                | SessionState::InSession
                | SessionState::Resend
                | SessionState::PendingTimeout(_)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Latent => "latent",
            SessionState::Logon => "logon",
            SessionState::Logout => "logout",
            SessionState::InSession => "in-session",
            SessionState::Resend => "resend",
            SessionState::PendingTimeout(PendingInner::InSession) => "pending-timeout(in-session)",
            SessionState::PendingTimeout(PendingInner::Resend) => "pending-timeout(resend)",
            SessionState::NotSessionTime => "not-session-time",
        };
        f.write_str(name)
    }
}

/// Administrative commands for a session actor.
#[derive(Debug)]
pub enum AdminEvent {
    /// A transport has been attached. `initiate_logon` means this side
    /// opens the logon exchange; outbound frames go to `out`.
    Connect {
        initiate_logon: bool,
        out: mpsc::Sender<Bytes>,
    },
    /// Drop state back to a fresh sequence epoch.
    ResetStore,
    /// Shut the session down; the actor loop returns.
    Stop,
}

/// Timer expirations, delivered on the same channel as everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Heartbeat,
    Logon,
    Logout,
    TestRequest,
}

/// One unit of session input, processed atomically and in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete frame from the transport, not yet decoded.
    Inbound(Bytes),
    /// An application send request.
    Send(Message),
    Admin(AdminEvent),
    /// Periodic clock tick; drives windows, heartbeats, and timeouts.
    Tick(DateTime<Utc>),
    Timeout(Timeout),
}
