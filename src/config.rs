//! Server configuration
//!
//! Parsed from command-line flags with environment fallbacks.

use std::time::Duration;

use crate::types::Protocol;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Which wire protocols the server accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProtocolPolicy {
    /// Let each client choose
    Any,
    /// Binary object graph only
    Graph,
    /// Framed markup only
    Markup,
}

impl ProtocolPolicy {
    pub fn allows(self, protocol: Protocol) -> bool {
        match self {
            ProtocolPolicy::Any => true,
            ProtocolPolicy::Graph => protocol == Protocol::Graph,
            ProtocolPolicy::Markup => protocol == Protocol::Markup,
        }
    }
}

/// Configuration for the messenger server.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "messenger", about = "Multi-user TCP chat server")]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, default_value = DEFAULT_ADDR, env = "MESSENGER_ADDR")]
    pub addr: String,

    /// Wire protocols accepted from clients.
    #[arg(long, value_enum, default_value_t = ProtocolPolicy::Any, env = "MESSENGER_PROTOCOL")]
    pub protocol: ProtocolPolicy,

    /// Close sessions that send nothing for this many seconds.
    #[arg(long, env = "MESSENGER_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// How long shutdown waits for sessions to finish, in milliseconds.
    #[arg(long, default_value_t = 2000, env = "MESSENGER_SHUTDOWN_GRACE_MS")]
    pub shutdown_grace_ms: u64,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            protocol: ProtocolPolicy::Any,
            idle_timeout_secs: None,
            shutdown_grace_ms: 2000,
        }
    }
}
