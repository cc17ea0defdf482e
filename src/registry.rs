//! Connection registry
//!
//! Tracks which usernames are held by live sessions. Owned by the
//! `ChatServer` actor, so every mutation is serialized through its
//! command loop.

use std::collections::{BTreeSet, HashMap};

use crate::error::AppError;
use crate::session::SessionHandle;
use crate::types::SessionId;

/// Username → session registry
///
/// Usernames are unique among registered sessions at all times.
#[derive(Debug, Default)]
pub struct Registry {
    /// Registered sessions: username -> handle
    sessions: HashMap<String, SessionHandle>,
    /// Reverse lookup: SessionId -> username
    usernames: HashMap<SessionId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its username
    ///
    /// Fails with `DuplicateUsername` if the name is already held.
    pub fn try_register(&mut self, handle: SessionHandle) -> Result<(), AppError> {
        if self.contains(&handle.username) {
            return Err(AppError::DuplicateUsername(handle.username));
        }
        self.usernames.insert(handle.id, handle.username.clone());
        self.sessions.insert(handle.username.clone(), handle);
        Ok(())
    }

    /// Remove a username; removing an absent name is a no-op
    pub fn deregister(&mut self, username: &str) -> Option<SessionHandle> {
        let handle = self.sessions.remove(username)?;
        self.usernames.remove(&handle.id);
        Some(handle)
    }

    /// Remove whatever username a session holds; no-op if it holds none
    pub fn deregister_session(&mut self, id: SessionId) -> Option<SessionHandle> {
        let username = self.usernames.remove(&id)?;
        self.sessions.remove(&username)
    }

    /// Point-in-time copy of the online usernames
    pub fn snapshot_usernames(&self) -> BTreeSet<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Username held by a session, if it is registered
    pub fn username_of(&self, id: SessionId) -> Option<&str> {
        self.usernames.get(&id).map(String::as_str)
    }

    pub fn session(&self, id: SessionId) -> Option<&SessionHandle> {
        self.username_of(id).and_then(|name| self.sessions.get(name))
    }

    pub fn contains(&self, username: &str) -> bool {
        self.sessions.contains_key(username)
    }

    /// All registered sessions, in no particular order
    pub fn sessions(&self) -> impl Iterator<Item = &SessionHandle> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
