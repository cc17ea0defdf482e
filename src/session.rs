//! Session state and handles
//!
//! `Session` tracks one connection's lifecycle on the connection task.
//! `SessionHandle` is the registry's view of an active session: enough to
//! address it and queue messages, without owning its socket.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, SendError};
use crate::message::Message;
use crate::types::{Protocol, SessionId};

/// Per-connection lifecycle state
///
/// ```text
/// Connected ──login──▶ Authenticating ──accepted──▶ Active
///     │                      │                        │
///     └──────────────────────┴────────────────────────┴──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, protocol negotiated, no username yet
    Connected,
    /// Login submitted, waiting for the uniqueness check
    Authenticating,
    /// Username accepted, message loop running
    Active,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connected, Authenticating)
                | (Authenticating, Active)
                | (Connected | Authenticating | Active, Closed)
        )
    }
}

/// Connection-side session state
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    protocol: Protocol,
    username: Option<String>,
    state: SessionState,
}

impl Session {
    /// Create a session for a freshly negotiated connection
    pub fn new(id: SessionId, protocol: Protocol) -> Self {
        Self {
            id,
            protocol,
            username: None,
            state: SessionState::Connected,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Username, once the session is active
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Get the display name for this session
    ///
    /// Returns the username if set, otherwise "Unknown".
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("Unknown")
    }

    /// `Connected → Authenticating`
    pub fn begin_login(&mut self) -> Result<(), AppError> {
        self.transition(SessionState::Authenticating)
    }

    /// `Authenticating → Active`; the username is set exactly once here
    pub fn activate(&mut self, username: String) -> Result<(), AppError> {
        self.transition(SessionState::Active)?;
        self.username = Some(username);
        Ok(())
    }

    /// Move to `Closed` from any state
    ///
    /// Returns the previous state; closing twice is a no-op.
    pub fn close(&mut self) -> SessionState {
        std::mem::replace(&mut self.state, SessionState::Closed)
    }

    fn transition(&mut self, next: SessionState) -> Result<(), AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Registry-side handle to an active session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Session this handle addresses
    pub id: SessionId,
    /// Username the session registered with
    pub username: String,
    /// Server → session outbound queue
    sender: mpsc::Sender<Message>,
    /// Ends the connection task
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(id: SessionId, username: String, sender: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            username,
            sender,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the handle to the connection task's cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Ask the connection task to end; it still flushes what is queued
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Queue a message for this session without waiting
    ///
    /// Returns an error if the queue is full or the session has gone away.
    pub fn deliver(&self, msg: Message) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}
