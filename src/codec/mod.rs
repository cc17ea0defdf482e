//! Wire codecs
//!
//! Two interchangeable encodings of [`Message`](crate::message::Message),
//! both driven through `tokio_util::codec::{FramedRead, FramedWrite}`:
//! - [`GraphCodec`]: length-prefixed binary object graph
//! - [`MarkupCodec`]: length-prefixed markup documents
//!
//! [`WireCodec`] selects one of them at runtime from the negotiated
//! [`Protocol`].

pub mod frame;
pub mod graph;
pub mod markup;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

pub use graph::GraphCodec;
pub use markup::{Direction, MarkupCodec, HISTORY_PAGE_SIZE};

use crate::error::CodecError;
use crate::message::Message;
use crate::types::Protocol;

/// Runtime-selected wire codec
#[derive(Debug, Clone)]
pub enum WireCodec {
    Graph(GraphCodec),
    Markup(MarkupCodec),
}

impl WireCodec {
    /// Codec for the server side of a connection
    pub fn for_server(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Graph => WireCodec::Graph(GraphCodec::new()),
            Protocol::Markup => WireCodec::Markup(MarkupCodec::server()),
        }
    }

    /// Codec for the client side of a connection
    pub fn for_client(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Graph => WireCodec::Graph(GraphCodec::new()),
            Protocol::Markup => WireCodec::Markup(MarkupCodec::client()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            WireCodec::Graph(_) => Protocol::Graph,
            WireCodec::Markup(_) => Protocol::Markup,
        }
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        match self {
            WireCodec::Graph(codec) => codec.decode(src),
            WireCodec::Markup(codec) => codec.decode(src),
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            WireCodec::Graph(codec) => codec.encode(item, dst),
            WireCodec::Markup(codec) => codec.encode(item, dst),
        }
    }
}
