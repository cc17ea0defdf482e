//! Multi-user TCP Chat Server Library
//!
//! A chat server where every connected user sees every other user's
//! messages, built on tokio using the Actor pattern for shared state.
//!
//! # Features
//! - Two wire protocols chosen per connection: a length-prefixed binary
//!   object graph and length-prefixed markup documents
//! - Unique usernames, enforced atomically at login
//! - Chat fan-out to everyone except the sender
//! - Join/leave presence events and on-demand user lists
//! - Last 100 chat lines replayed to newly logged-in users
//! - Graceful shutdown that deregisters every session
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` is the central actor owning the registry and history
//! - Each connection has a `handler` task communicating with the server
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use messenger::{ChatListener, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), messenger::AppError> {
//!     let listener = ChatListener::bind(ServerConfig::default()).await?;
//!     let shutdown = listener.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!     listener.run().await
//! }
//! ```

pub mod broadcast;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod history;
pub mod listener;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use broadcast::{BroadcastEngine, Fanout};
pub use client::{ChatClient, ChatEvents};
pub use codec::{GraphCodec, MarkupCodec, WireCodec};
pub use config::{ProtocolPolicy, ServerConfig};
pub use error::{AppError, CodecError, SendError};
pub use handler::handle_connection;
pub use history::HistoryBuffer;
pub use listener::{ChatListener, ShutdownHandle};
pub use message::{HistoryEntry, Message};
pub use registry::Registry;
pub use server::{ChatServer, ServerCommand};
pub use session::{Session, SessionHandle, SessionState};
pub use types::{Protocol, SessionId};
