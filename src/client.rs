//! Client protocol engine
//!
//! Speaks either wire protocol to a messenger server and turns incoming
//! events into callbacks on a [`ChatEvents`] implementation, which is
//! where a presentation layer plugs in.

use std::collections::BTreeSet;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::WireCodec;
use crate::error::AppError;
use crate::message::{HistoryEntry, Message};
use crate::types::Protocol;

/// Callbacks for server events
///
/// Called from the client's receiver task, in arrival order.
pub trait ChatEvents: Send + 'static {
    /// Another user said something
    fn on_chat_message(&mut self, sender: &str, text: &str);

    /// A user joined (`is_login`) or left
    fn on_presence(&mut self, username: &str, is_login: bool);

    /// Full list of online users
    fn on_user_list(&mut self, usernames: &BTreeSet<String>);

    /// One page of past chat lines, oldest first
    fn on_history(&mut self, entries: &[HistoryEntry]);

    /// The connection ended
    fn on_disconnect(&mut self) {}
}

/// Logged-in connection to a messenger server
pub struct ChatClient {
    username: String,
    session: Option<String>,
    writer: FramedWrite<OwnedWriteHalf, WireCodec>,
    receiver: JoinHandle<()>,
}

impl ChatClient {
    /// Connect, choose `protocol` and log in as `username`
    ///
    /// Fails with `AppError::LoginRejected` when the server refuses the
    /// name. On success, `events` starts receiving callbacks, beginning
    /// with the user list and history.
    pub async fn connect<A, E>(
        addr: A,
        protocol: Protocol,
        username: &str,
        events: E,
    ) -> Result<Self, AppError>
    where
        A: ToSocketAddrs,
        E: ChatEvents,
    {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_u8(protocol.preamble()).await?;

        let (read_half, write_half) = stream.into_split();
        let codec = WireCodec::for_client(protocol);
        let mut reader = FramedRead::new(read_half, codec.clone());
        let mut writer = FramedWrite::new(write_half, codec);

        writer
            .send(Message::Login {
                username: username.to_string(),
            })
            .await?;

        let session = loop {
            match reader.next().await {
                Some(Ok(Message::Success { session })) => break session,
                Some(Ok(Message::Error { reason })) => return Err(AppError::LoginRejected(reason)),
                Some(Ok(other)) => debug!("Ignoring '{}' before login was acknowledged", other.name()),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(AppError::ConnectionClosed),
            }
        };
        debug!("Logged in as '{}' (session {:?})", username, session);

        let receiver = tokio::spawn(dispatch_events(reader, events));

        Ok(Self {
            username: username.to_string(),
            session,
            writer,
            receiver,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Session token issued by the server, if any
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Send a chat line to everyone else
    pub async fn send_chat(&mut self, text: &str) -> Result<(), AppError> {
        self.writer
            .send(Message::Chat {
                sender: self.username.clone(),
                text: text.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Ask the server for a fresh user list
    pub async fn request_user_list(&mut self) -> Result<(), AppError> {
        self.writer.send(Message::ListUsers).await?;
        Ok(())
    }

    /// Log out and close the sending side
    ///
    /// `on_disconnect` fires once the server closes the connection.
    pub async fn send_logout(&mut self) -> Result<(), AppError> {
        self.writer.send(Message::Logout).await?;
        self.writer.close().await?;
        Ok(())
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Receiver task: decode events and invoke callbacks
async fn dispatch_events<E: ChatEvents>(
    mut reader: FramedRead<OwnedReadHalf, WireCodec>,
    mut events: E,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Chat { sender, text }) => events.on_chat_message(&sender, &text),
            Ok(Message::UserEvent { username, is_login }) => events.on_presence(&username, is_login),
            Ok(Message::UserList { usernames }) => events.on_user_list(&usernames),
            Ok(Message::History { entries }) => events.on_history(&entries),
            Ok(Message::Error { reason }) => warn!("Server reported an error: {}", reason),
            Ok(other) => debug!("Ignoring '{}' from server", other.name()),
            Err(e) => {
                warn!("Connection to server failed: {}", e);
                break;
            }
        }
    }
    events.on_disconnect();
}
