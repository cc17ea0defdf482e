//! ChatServer Actor implementation
//!
//! The central actor that owns all shared state: the connection registry,
//! the broadcast engine and its history. Every registration, deregistration
//! and broadcast goes through its command loop, so they are serialized
//! without locks and no socket I/O ever happens while handling a command.
//!
//! A session whose outbound queue overflows is deregistered on the spot and
//! its connection task cancelled. Dropping its handle closes the queue, so
//! the session's writer flushes what was already queued and then
//! disconnects. Every client therefore sees an unbroken prefix of the event
//! stream.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastEngine, Fanout};
use crate::error::{AppError, SendError};
use crate::history::HistoryBuffer;
use crate::message::{HistoryEntry, Message};
use crate::registry::Registry;
use crate::session::SessionHandle;
use crate::types::SessionId;

/// Commands sent from connection tasks to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// Register a username for a session
    Login {
        session_id: SessionId,
        username: String,
        sender: mpsc::Sender<Message>,
        /// Cancelled if the session is evicted
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    /// Broadcast a chat line from an active session
    ///
    /// With `ack` set, the sender gets `Success` once the line is out.
    Chat {
        session_id: SessionId,
        text: String,
        ack: bool,
    },
    /// Send the current user list to a session
    ListUsers {
        session_id: SessionId,
    },
    /// Queue a message for one session only
    Reply {
        session_id: SessionId,
        message: Message,
    },
    /// Session ended (graceful or not); idempotent
    Logout {
        session_id: SessionId,
    },
}

/// The main ChatServer actor
///
/// Processes commands from connection tasks one at a time.
pub struct ChatServer {
    /// Online sessions by username
    registry: Registry,
    /// Fan-out and chat history
    engine: BroadcastEngine,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
}

impl ChatServer {
    /// Create a new ChatServer with the given command receiver
    pub fn new(receiver: mpsc::Receiver<ServerCommand>) -> Self {
        Self::with_history(receiver, HistoryBuffer::default())
    }

    /// Create a ChatServer with a custom history buffer
    pub fn with_history(receiver: mpsc::Receiver<ServerCommand>, history: HistoryBuffer) -> Self {
        Self {
            registry: Registry::new(),
            engine: BroadcastEngine::new(history),
            receiver,
        }
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Login {
                session_id,
                username,
                sender,
                cancel,
                reply,
            } => {
                let handle = SessionHandle::new(session_id, username, sender).with_cancel(cancel);
                let result = self.handle_login(handle);
                if reply.send(result).is_err() {
                    // The connection went away while waiting; undo the registration
                    debug!("Login reply for {} dropped", session_id);
                    self.handle_logout(session_id);
                }
            }
            ServerCommand::Chat {
                session_id,
                text,
                ack,
            } => {
                self.handle_chat(session_id, text, ack);
            }
            ServerCommand::ListUsers { session_id } => {
                let msg = Message::UserList {
                    usernames: self.registry.snapshot_usernames(),
                };
                self.send_to(session_id, msg);
            }
            ServerCommand::Reply {
                session_id,
                message,
            } => {
                self.send_to(session_id, message);
            }
            ServerCommand::Logout { session_id } => {
                self.handle_logout(session_id);
            }
        }
    }

    /// Handle a login request
    ///
    /// On success the new session is queued `Success`, `UserList` and
    /// `History`, in that order, before any later broadcast.
    fn handle_login(&mut self, handle: SessionHandle) -> Result<(), AppError> {
        let session_id = handle.id;
        let username = handle.username.clone();
        if let Err(e) = self.registry.try_register(handle) {
            info!("Session {} rejected: {}", session_id, e);
            return Err(e);
        }

        info!("Session {} logged in as '{}'", session_id, username);
        let fanout = self
            .engine
            .broadcast_presence(&self.registry, &username, true);
        self.evict(fanout);

        let greeting = [
            Message::Success {
                session: Some(session_id.to_string()),
            },
            Message::UserList {
                usernames: self.registry.snapshot_usernames(),
            },
            Message::History {
                entries: self.engine.history_snapshot(),
            },
        ];
        for msg in greeting {
            self.send_to(session_id, msg);
        }

        debug!("Online users: {}", self.registry.len());
        Ok(())
    }

    /// Handle chat message
    fn handle_chat(&mut self, session_id: SessionId, text: String, ack: bool) {
        let Some(sender) = self.registry.username_of(session_id) else {
            warn!("Chat from unregistered session {} dropped", session_id);
            return;
        };

        let entry = HistoryEntry::new(sender, text);
        let fanout = self
            .engine
            .broadcast_chat(&self.registry, entry, Some(session_id));
        self.evict(fanout);

        if ack {
            self.send_to(session_id, Message::Success { session: None });
        }
    }

    /// Queue a message for one registered session
    fn send_to(&mut self, session_id: SessionId, msg: Message) {
        let Some(handle) = self.registry.session(session_id) else {
            debug!("Session {} not registered, '{}' dropped", session_id, msg.name());
            return;
        };

        match handle.deliver(msg) {
            Ok(()) => {}
            Err(SendError::Full) => self.evict(Fanout {
                delivered: 0,
                lagging: vec![session_id],
            }),
            Err(e) => warn!("Failed to send to '{}': {}", handle.username, e),
        }
    }

    /// Disconnect sessions that could not keep up
    ///
    /// Their leave events may overflow further queues, which are
    /// disconnected in turn.
    fn evict(&mut self, fanout: Fanout) {
        let mut lagging = fanout.lagging;
        while let Some(session_id) = lagging.pop() {
            let Some(handle) = self.registry.deregister_session(session_id) else {
                continue;
            };

            warn!(
                "Session {} ('{}') fell behind, disconnecting",
                session_id, handle.username
            );
            handle.disconnect();
            let fanout = self
                .engine
                .broadcast_presence(&self.registry, &handle.username, false);
            lagging.extend(fanout.lagging);
        }
    }

    /// Handle session termination
    fn handle_logout(&mut self, session_id: SessionId) {
        let Some(handle) = self.registry.deregister_session(session_id) else {
            debug!("Session {} was not registered", session_id);
            return;
        };

        info!("User '{}' left", handle.username);
        let fanout = self
            .engine
            .broadcast_presence(&self.registry, &handle.username, false);
        self.evict(fanout);
        debug!("Online users: {}", self.registry.len());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    struct Harness {
        cmd_tx: mpsc::Sender<ServerCommand>,
    }

    impl Harness {
        fn start() -> Self {
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            tokio::spawn(ChatServer::new(cmd_rx).run());
            Self { cmd_tx }
        }

        async fn login(
            &self,
            username: &str,
        ) -> (SessionId, Result<(), AppError>, mpsc::Receiver<Message>) {
            let session_id = SessionId::new();
            let (tx, rx) = mpsc::channel(32);
            let (reply_tx, reply_rx) = oneshot::channel();
            self.cmd_tx
                .send(ServerCommand::Login {
                    session_id,
                    username: username.to_string(),
                    sender: tx,
                    cancel: CancellationToken::new(),
                    reply: reply_tx,
                })
                .await
                .unwrap();
            (session_id, reply_rx.await.unwrap(), rx)
        }

        async fn send(&self, cmd: ServerCommand) {
            self.cmd_tx.send(cmd).await.unwrap();
        }
    }

    async fn skip_greeting(rx: &mut mpsc::Receiver<Message>) {
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_login_greeting() {
        let server = Harness::start();
        let (id, result, mut rx) = server.login("alice").await;
        result.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            Message::Success {
                session: Some(id.to_string())
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Message::UserList {
                usernames: BTreeSet::from(["alice".to_string()])
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Message::History { entries: vec![] }
        );
    }

    #[tokio::test]
    async fn test_duplicate_login_rejected() {
        let server = Harness::start();
        let (_, first, _rx1) = server.login("alice").await;
        let (_, second, mut rx2) = server.login("alice").await;

        assert!(first.is_ok());
        assert!(matches!(second, Err(AppError::DuplicateUsername(_))));
        // Nothing queued for the rejected session and its sender was dropped
        assert_eq!(rx2.recv().await, None);
    }

    #[tokio::test]
    async fn test_chat_and_presence_flow() {
        let server = Harness::start();
        let (alice, _, mut alice_rx) = server.login("alice").await;
        skip_greeting(&mut alice_rx).await;
        let (bob, _, mut bob_rx) = server.login("bob").await;
        skip_greeting(&mut bob_rx).await;

        assert_eq!(
            alice_rx.recv().await.unwrap(),
            Message::UserEvent {
                username: "bob".into(),
                is_login: true
            }
        );

        server
            .send(ServerCommand::Chat {
                session_id: alice,
                text: "hi".into(),
                ack: false,
            })
            .await;
        assert_eq!(
            bob_rx.recv().await.unwrap(),
            Message::Chat {
                sender: "alice".into(),
                text: "hi".into()
            }
        );

        server.send(ServerCommand::Logout { session_id: bob }).await;
        server.send(ServerCommand::Logout { session_id: bob }).await;
        assert_eq!(
            alice_rx.recv().await.unwrap(),
            Message::UserEvent {
                username: "bob".into(),
                is_login: false
            }
        );

        // Alice never saw her own chat and only one logout event for bob
        server.send(ServerCommand::ListUsers { session_id: alice }).await;
        assert_eq!(
            alice_rx.recv().await.unwrap(),
            Message::UserList {
                usernames: BTreeSet::from(["alice".to_string()])
            }
        );
    }

    #[tokio::test]
    async fn test_late_joiner_gets_history() {
        let server = Harness::start();
        let (alice, _, mut alice_rx) = server.login("alice").await;
        skip_greeting(&mut alice_rx).await;

        server
            .send(ServerCommand::Chat {
                session_id: alice,
                text: "first".into(),
                ack: false,
            })
            .await;

        let (_, _, mut carol_rx) = server.login("carol").await;
        carol_rx.recv().await.unwrap();
        carol_rx.recv().await.unwrap();
        assert_eq!(
            carol_rx.recv().await.unwrap(),
            Message::History {
                entries: vec![HistoryEntry::new("alice", "first")]
            }
        );
    }

    #[tokio::test]
    async fn test_chat_from_unregistered_session_dropped() {
        let server = Harness::start();
        let (_, _, mut alice_rx) = server.login("alice").await;
        skip_greeting(&mut alice_rx).await;

        server
            .send(ServerCommand::Chat {
                session_id: SessionId::new(),
                text: "ghost".into(),
                ack: false,
            })
            .await;
        let (_, _, mut bob_rx) = server.login("bob").await;
        bob_rx.recv().await.unwrap();
        bob_rx.recv().await.unwrap();
        assert_eq!(
            bob_rx.recv().await.unwrap(),
            Message::History { entries: vec![] }
        );
    }

    #[tokio::test]
    async fn test_chat_ack_goes_to_sender_only() {
        let server = Harness::start();
        let (alice, _, mut alice_rx) = server.login("alice").await;
        skip_greeting(&mut alice_rx).await;
        let (_, _, mut bob_rx) = server.login("bob").await;
        skip_greeting(&mut bob_rx).await;
        alice_rx.recv().await.unwrap();

        server
            .send(ServerCommand::Chat {
                session_id: alice,
                text: "hi".into(),
                ack: true,
            })
            .await;

        assert_eq!(
            alice_rx.recv().await.unwrap(),
            Message::Success { session: None }
        );
        assert_eq!(
            bob_rx.recv().await.unwrap(),
            Message::Chat {
                sender: "alice".into(),
                text: "hi".into()
            }
        );
        // The ack is never broadcast
        server.send(ServerCommand::ListUsers { session_id: alice }).await;
        alice_rx.recv().await.unwrap();
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reply_reaches_one_session() {
        let server = Harness::start();
        let (alice, _, mut alice_rx) = server.login("alice").await;
        skip_greeting(&mut alice_rx).await;

        let rejection = Message::Error {
            reason: "Invalid message format".into(),
        };
        server
            .send(ServerCommand::Reply {
                session_id: alice,
                message: rejection.clone(),
            })
            .await;
        assert_eq!(alice_rx.recv().await.unwrap(), rejection);
    }

    #[tokio::test]
    async fn test_lagging_session_is_disconnected() {
        let server = Harness::start();
        let (alice, _, mut alice_rx) = server.login("alice").await;
        skip_greeting(&mut alice_rx).await;

        // Room for the greeting plus one more message, and never read
        let (slow_tx, mut slow_rx) = mpsc::channel(4);
        let slow_cancel = CancellationToken::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        server
            .send(ServerCommand::Login {
                session_id: SessionId::new(),
                username: "slow".into(),
                sender: slow_tx,
                cancel: slow_cancel.clone(),
                reply: reply_tx,
            })
            .await;
        reply_rx.await.unwrap().unwrap();
        assert_eq!(
            alice_rx.recv().await.unwrap(),
            Message::UserEvent {
                username: "slow".into(),
                is_login: true
            }
        );

        for text in ["one", "two", "three"] {
            server
                .send(ServerCommand::Chat {
                    session_id: alice,
                    text: text.into(),
                    ack: false,
                })
                .await;
        }

        assert_eq!(
            alice_rx.recv().await.unwrap(),
            Message::UserEvent {
                username: "slow".into(),
                is_login: false
            }
        );

        // Everything queued before the overflow arrives, then the stream ends
        skip_greeting(&mut slow_rx).await;
        assert_eq!(
            slow_rx.recv().await.unwrap(),
            Message::Chat {
                sender: "alice".into(),
                text: "one".into()
            }
        );
        assert_eq!(slow_rx.recv().await, None);
        assert!(slow_cancel.is_cancelled());

        server.send(ServerCommand::ListUsers { session_id: alice }).await;
        assert_eq!(
            alice_rx.recv().await.unwrap(),
            Message::UserList {
                usernames: BTreeSet::from(["alice".to_string()])
            }
        );
    }
}
