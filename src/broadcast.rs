//! Broadcast engine
//!
//! Fans chat lines and presence events out to registered sessions and
//! keeps the chat history. Delivery only queues onto each recipient's
//! outbound channel; the socket write happens on the recipient's own task.

use tracing::{debug, warn};

use crate::error::SendError;
use crate::history::HistoryBuffer;
use crate::message::{HistoryEntry, Message};
use crate::registry::Registry;
use crate::types::SessionId;

/// Outcome of one fan-out
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Fanout {
    /// Sessions the message was queued for
    pub delivered: usize,
    /// Sessions whose outbound queue was full; they missed this message
    pub lagging: Vec<SessionId>,
}

impl Fanout {
    fn record(&mut self, session: SessionId, result: Result<(), SendError>) {
        match result {
            Ok(()) => self.delivered += 1,
            Err(SendError::Full) => self.lagging.push(session),
            // Already gone; its handler deregisters it
            Err(SendError::ChannelClosed) => {}
        }
    }
}

/// Chat fan-out plus the bounded chat history
#[derive(Debug, Default)]
pub struct BroadcastEngine {
    history: HistoryBuffer,
}

impl BroadcastEngine {
    pub fn new(history: HistoryBuffer) -> Self {
        Self { history }
    }

    /// Record a chat line and deliver it to every session except `exclude`
    pub fn broadcast_chat(
        &mut self,
        registry: &Registry,
        entry: HistoryEntry,
        exclude: Option<SessionId>,
    ) -> Fanout {
        let msg = Message::Chat {
            sender: entry.sender.clone(),
            text: entry.text.clone(),
        };
        self.history.push(entry);

        let mut fanout = Fanout::default();
        for session in registry.sessions().filter(|s| Some(s.id) != exclude) {
            let result = session.deliver(msg.clone());
            if let Err(e) = &result {
                warn!("Failed to deliver chat to {}: {}", session.username, e);
            }
            fanout.record(session.id, result);
        }
        debug!("Chat fanned out to {} sessions", fanout.delivered);
        fanout
    }

    /// Tell every session except `username`'s own that it joined or left
    pub fn broadcast_presence(&self, registry: &Registry, username: &str, is_login: bool) -> Fanout {
        let msg = Message::UserEvent {
            username: username.to_string(),
            is_login,
        };

        let mut fanout = Fanout::default();
        for session in registry.sessions().filter(|s| s.username != username) {
            let result = session.deliver(msg.clone());
            if let Err(e) = &result {
                warn!(
                    "Failed to deliver presence of {} to {}: {}",
                    username, session.username, e
                );
            }
            fanout.record(session.id, result);
        }
        fanout
    }

    /// Point-in-time copy of the chat history, oldest first
    pub fn history_snapshot(&self) -> Vec<HistoryEntry> {
        self.history.snapshot()
    }
}
