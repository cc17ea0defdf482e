//! Connection handler
//!
//! Drives one TCP connection through its session lifecycle: protocol
//! negotiation, login, the inbound message loop and the outbound writer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::WireCodec;
use crate::config::{ProtocolPolicy, ServerConfig};
use crate::error::AppError;
use crate::message::Message;
use crate::server::ServerCommand;
use crate::session::Session;
use crate::types::{Protocol, SessionId};

/// Outbound queue size per session
pub const OUTBOUND_BUFFER_SIZE: usize = 256;

/// How long a closing session may spend flushing its queue
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type Reader = FramedRead<OwnedReadHalf, WireCodec>;
type Writer = FramedWrite<OwnedWriteHalf, WireCodec>;

/// Handle a new TCP connection
///
/// Negotiates the protocol, performs the login handshake with the
/// ChatServer actor, then runs the session until the peer logs out,
/// the connection fails, or `shutdown` is cancelled. An accepted
/// username is always deregistered before this returns.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let idle_timeout = config.idle_timeout();

    debug!("New TCP connection from {}", peer_addr);

    let (mut read_half, write_half) = stream.into_split();

    // Protocol negotiation
    let negotiated = tokio::select! {
        negotiated = idle_guard(idle_timeout, negotiate(&mut read_half, config.protocol)) => negotiated,
        _ = shutdown.cancelled() => return Ok(()),
    };
    let Some(protocol) = negotiated.transpose()? else {
        debug!("Connection from {} idle before choosing a protocol", peer_addr);
        return Ok(());
    };

    let session_id = SessionId::new();
    let mut session = Session::new(session_id, protocol);
    info!("Session {} from {} uses {} protocol", session_id, peer_addr, protocol);

    let codec = WireCodec::for_server(protocol);
    let mut reader = FramedRead::new(read_half, codec.clone());
    let mut writer = FramedWrite::new(write_half, codec);

    // Login
    let username = tokio::select! {
        login = await_login(&mut reader, &mut writer, idle_timeout) => login?,
        _ = shutdown.cancelled() => None,
    };
    let Some(username) = username else {
        session.close();
        debug!("Session {} closed before login", session_id);
        return Ok(());
    };
    session.begin_login()?;

    if username.trim().is_empty() {
        return reject(&mut writer, &mut session, AppError::InvalidUsername(username)).await;
    }

    let (msg_tx, msg_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
    let (reply_tx, reply_rx) = oneshot::channel();
    cmd_tx
        .send(ServerCommand::Login {
            session_id,
            username: username.clone(),
            sender: msg_tx,
            cancel: shutdown.clone(),
            reply: reply_tx,
        })
        .await
        .map_err(|_| AppError::ChannelSend)?;

    if let Err(e) = reply_rx.await.map_err(|_| AppError::ChannelSend)? {
        return reject(&mut writer, &mut session, e).await;
    }

    if let Err(e) = session.activate(username) {
        let _ = cmd_tx.send(ServerCommand::Logout { session_id }).await;
        return Err(e);
    }

    let result = run_active(session_id, reader, writer, msg_rx, &cmd_tx, idle_timeout, &shutdown).await;

    session.close();
    info!("Session {} ({}) disconnected", session_id, session.display_name());
    result
}

/// Read the preamble byte and check it against the server policy
async fn negotiate(read_half: &mut OwnedReadHalf, policy: ProtocolPolicy) -> Result<Protocol, AppError> {
    let byte = read_half.read_u8().await?;
    match Protocol::from_preamble(byte) {
        Some(protocol) if policy.allows(protocol) => Ok(protocol),
        _ => Err(AppError::UnsupportedProtocol(byte)),
    }
}

/// Wait for a `Login`; `None` if the peer leaves first
///
/// Rejections produced by the decoder, such as a login without a name,
/// are written straight back and the wait continues.
async fn await_login(
    reader: &mut Reader,
    writer: &mut Writer,
    idle_timeout: Option<Duration>,
) -> Result<Option<String>, AppError> {
    loop {
        let Some(next) = idle_guard(idle_timeout, reader.next()).await else {
            return Ok(None);
        };
        match next.transpose()? {
            Some(Message::Login { username }) => return Ok(Some(username)),
            Some(Message::Logout) | None => return Ok(None),
            Some(Message::Error { reason }) => {
                debug!("Rejecting pre-login input: {}", reason);
                writer.send(Message::Error { reason }).await?;
            }
            Some(other) => warn!("Ignoring '{}' before login", other.name()),
        }
    }
}

/// Send the rejection to the client and close without registering
async fn reject(writer: &mut Writer, session: &mut Session, err: AppError) -> Result<(), AppError> {
    info!("Session {} login rejected: {}", session.id(), err);
    session.close();
    writer.send(Message::from(&err)).await?;
    writer.close().await?;
    Ok(())
}

/// Run an active session until it ends, then deregister it
async fn run_active(
    session_id: SessionId,
    mut reader: Reader,
    writer: Writer,
    msg_rx: mpsc::Receiver<Message>,
    cmd_tx: &mpsc::Sender<ServerCommand>,
    idle_timeout: Option<Duration>,
    shutdown: &CancellationToken,
) -> Result<(), AppError> {
    let mut write_task = tokio::spawn(write_outbound(writer, msg_rx, session_id));
    let mut write_finished = false;

    let result = tokio::select! {
        inbound = pump_inbound(&mut reader, session_id, cmd_tx, idle_timeout) => inbound,
        _ = &mut write_task => {
            write_finished = true;
            debug!("Write task completed for {}", session_id);
            Ok(())
        }
        _ = shutdown.cancelled() => {
            debug!("Session {} cancelled", session_id);
            Ok(())
        }
    };

    // Deregister exactly once, however the session ended
    let _ = cmd_tx.send(ServerCommand::Logout { session_id }).await;

    // The actor drops our queue on logout, which lets the writer finish
    if !write_finished && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut write_task).await.is_err() {
        warn!("Write task for {} did not drain in time", session_id);
        write_task.abort();
    }

    result
}

/// Decode inbound messages and forward them to the actor
///
/// Markup senders get a `Success` for every accepted chat line.
async fn pump_inbound(
    reader: &mut Reader,
    session_id: SessionId,
    cmd_tx: &mpsc::Sender<ServerCommand>,
    idle_timeout: Option<Duration>,
) -> Result<(), AppError> {
    let ack = reader.decoder().protocol() == Protocol::Markup;
    loop {
        let Some(next) = idle_guard(idle_timeout, reader.next()).await else {
            info!("Session {} idle for too long", session_id);
            return Ok(());
        };
        let Some(frame) = next else {
            debug!("Session {} reached end of stream", session_id);
            return Ok(());
        };

        let cmd = match frame? {
            // The sender is always the session's own username
            Message::Chat { text, .. } => ServerCommand::Chat {
                session_id,
                text,
                ack,
            },
            Message::ListUsers => ServerCommand::ListUsers { session_id },
            // Decoder rejection; goes back through the session's own queue
            Message::Error { reason } => ServerCommand::Reply {
                session_id,
                message: Message::Error { reason },
            },
            Message::Logout => {
                debug!("Session {} logged out", session_id);
                return Ok(());
            }
            other => {
                warn!("Ignoring unexpected '{}' from session {}", other.name(), session_id);
                continue;
            }
        };

        if cmd_tx.send(cmd).await.is_err() {
            debug!("Server closed, ending read loop for {}", session_id);
            return Err(AppError::ChannelSend);
        }
    }
}

/// Write queued messages until the queue closes or the socket fails
async fn write_outbound(mut writer: Writer, mut msg_rx: mpsc::Receiver<Message>, session_id: SessionId) {
    while let Some(msg) = msg_rx.recv().await {
        if let Err(e) = writer.send(msg).await {
            debug!("Write to {} failed: {}", session_id, e);
            return;
        }
    }
    debug!("Write task ended for {}", session_id);

    let _ = writer.close().await;
}

/// Apply the optional idle timeout; `None` means it elapsed
async fn idle_guard<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
