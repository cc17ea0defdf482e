//! Error types for the messenger
//!
//! Defines wire-level codec errors, application-level errors and
//! per-recipient delivery errors. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::session::SessionState;

/// Wire codec errors
///
/// `Protocol` is fatal for every codec. `Parse` is fatal for the graph codec
/// and skipped by the markup codec. `UnknownCommand` is always skipped, and
/// `MissingField` is answered with an error reply.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Malformed frame or length prefix
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed payload (markup document or binary object graph)
    #[error("parse error: {0}")]
    Parse(String),

    /// Well-formed document lacking a child its command requires
    #[error("<{command}> is missing <{field}>")]
    MissingField { command: String, field: String },

    /// Well-formed document naming an unknown command or event
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// IO error on the underlying transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether a codec able to resynchronize may skip this error and continue
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CodecError::Parse(_) | CodecError::UnknownCommand(_) | CodecError::MissingField { .. }
        )
    }
}

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// user-facing errors (sent to the client as an `Error` message).
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire codec error (fatal once it reaches the session)
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Username is already held by an active session
    #[error("Username '{0}' is already taken")]
    DuplicateUsername(String),

    /// Username is empty or otherwise unusable
    #[error("Invalid username: {0:?}")]
    InvalidUsername(String),

    /// The server rejected our login (client side)
    #[error("Login rejected: {0}")]
    LoginRejected(String),

    /// Unknown or disallowed protocol preamble byte
    #[error("Unsupported protocol selector: {0:#04x}")]
    UnsupportedProtocol(u8),

    /// Illegal session state transition (programming error)
    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Peer closed the connection before the exchange completed
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Message delivery errors
///
/// Occurs when a message cannot be queued for a single recipient.
#[derive(Debug, Error)]
pub enum SendError {
    /// The recipient's outbound queue is full
    #[error("Outbound queue full")]
    Full,

    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
