//! TCP listener
//!
//! Accepts connections, spawns one session task per connection and owns
//! the ChatServer actor for the lifetime of the server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::server::ChatServer;

/// Channel buffer size for server commands
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Cloneable handle that stops a running [`ChatListener`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    /// Request shutdown; calling it again has no further effect
    pub fn shutdown(&self) {
        self.0.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Bound chat server, ready to run
pub struct ChatListener {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
}

impl ChatListener {
    /// Bind the listening socket described by `config`
    pub async fn bind(config: ServerConfig) -> Result<Self, AppError> {
        let listener = TcpListener::bind(&config.addr).await?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, AppError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Accept connections until shutdown is requested
    ///
    /// On shutdown the listening socket is closed first, then every session
    /// is cancelled and given the configured grace period to deregister
    /// before it is aborted.
    pub async fn run(self) -> Result<(), AppError> {
        let ChatListener {
            listener,
            config,
            shutdown,
        } = self;

        // Create ChatServer actor channel and start
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let server_task = tokio::spawn(ChatServer::new(cmd_rx).run());
        let mut sessions = JoinSet::new();

        // Connection accept loop
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        let cmd_tx = cmd_tx.clone();
                        let config = config.clone();
                        let shutdown = shutdown.child_token();

                        // Spawn handler task for each connection
                        sessions.spawn(async move {
                            if let Err(e) = handle_connection(stream, cmd_tx, config, shutdown).await {
                                warn!("Connection from {} ended with error: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        info!("Listener closed, stopping {} sessions", sessions.len());

        let drained = tokio::time::timeout(config.shutdown_grace(), async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("{} sessions did not stop in time, aborting", sessions.len());
            sessions.shutdown().await;
        }

        // Last sender gone: the actor finishes its queue and exits
        drop(cmd_tx);
        if let Err(e) = server_task.await {
            error!("ChatServer task failed: {}", e);
        }
        debug!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let listener = ChatListener::bind(local_config()).await.unwrap();
        let handle = listener.shutdown_handle();
        let run = tokio::spawn(listener.run());

        handle.shutdown();
        handle.shutdown();
        assert!(handle.is_shutdown());

        let result = tokio::time::timeout(Duration::from_secs(5), run).await;
        assert!(result.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_with_silent_peer() {
        let listener = ChatListener::bind(local_config()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = listener.shutdown_handle();
        let run = tokio::spawn(listener.run());

        // Connected but never sends a byte
        let _silent = TcpStream::connect(addr).await.unwrap();
        let mut half_done = TcpStream::connect(addr).await.unwrap();
        half_done.write_all(b"X").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), run).await;
        assert!(result.unwrap().unwrap().is_ok());

        // Listening socket is gone
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
