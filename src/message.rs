//! Message protocol definitions
//!
//! The logical message vocabulary exchanged between client and server,
//! independent of wire encoding. Both codecs carry exactly this enum.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// One chat line retained in the history buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sender: String,
    pub text: String,
}

impl HistoryEntry {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
        }
    }
}

/// Client ↔ Server message
///
/// Each variant carries exactly the fields relevant to its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Request to join under a username (client → server)
    Login { username: String },
    /// Chat line; the server fills in `sender` from the session
    Chat { sender: String, text: String },
    /// Leave the chat (client → server)
    Logout,
    /// Ask for the current user list (client → server)
    ListUsers,
    /// Another user joined or left (server → client)
    UserEvent { username: String, is_login: bool },
    /// Users currently online (server → client)
    UserList { usernames: BTreeSet<String> },
    /// Past chat lines, oldest first (server → client)
    History { entries: Vec<HistoryEntry> },
    /// Login accepted (server → client)
    Success { session: Option<String> },
    /// Request rejected (server → client)
    Error { reason: String },
}

impl Message {
    /// Wire event name of this message
    pub fn name(&self) -> &'static str {
        match self {
            Message::Login { .. } => "login",
            Message::Chat { .. } => "message",
            Message::Logout => "logout",
            Message::ListUsers => "list",
            Message::UserEvent { is_login: true, .. } => "userlogin",
            Message::UserEvent { is_login: false, .. } => "userlogout",
            Message::UserList { .. } => "userlist",
            Message::History { .. } => "history",
            Message::Success { .. } => "success",
            Message::Error { .. } => "error",
        }
    }
}

/// Convert a user-facing AppError into an `Error` message for the client
impl From<&AppError> for Message {
    fn from(err: &AppError) -> Self {
        let reason = match err {
            AppError::DuplicateUsername(_) | AppError::InvalidUsername(_) => err.to_string(),
            // Fatal errors are not typically converted (connection closes)
            _ => "Internal error".to_string(),
        };
        Message::Error { reason }
    }
}
