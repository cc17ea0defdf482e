//! Basic type definitions for the messenger
//!
//! Provides newtype wrappers and small enums shared across modules:
//! - `SessionId`: UUID-based unique session identifier
//! - `Protocol`: wire protocol selected by the client's preamble byte

use uuid::Uuid;

/// Unique session identifier (newtype pattern)
///
/// Wraps a UUID v4 for type-safe session identification.
/// Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire protocol in use on a connection
///
/// Chosen by the first byte the client writes and fixed for the
/// lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Length-prefixed binary object graph
    Graph,
    /// Length-prefixed markup documents
    Markup,
}

impl Protocol {
    /// Preamble byte announcing this protocol
    pub fn preamble(self) -> u8 {
        match self {
            Protocol::Graph => b'G',
            Protocol::Markup => b'X',
        }
    }

    /// Parse a preamble byte
    pub fn from_preamble(byte: u8) -> Option<Self> {
        match byte {
            b'G' => Some(Protocol::Graph),
            b'X' => Some(Protocol::Markup),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Graph => f.write_str("graph"),
            Protocol::Markup => f.write_str("markup"),
        }
    }
}
