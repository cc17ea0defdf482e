//! Graph codec
//!
//! Each message is one length-prefixed `bincode` image of [`Message`].
//! The enum encoding is self-describing (variant index followed by fields).
//! A payload that fails to decode cannot be resynchronized, so decode
//! errors end the frame stream.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::frame::{self, MAX_FRAME_LEN};
use crate::error::CodecError;
use crate::message::Message;

/// Length-prefixed binary object graph codec
#[derive(Debug, Clone)]
pub struct GraphCodec {
    max_frame_len: usize,
}

impl GraphCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    /// Override the maximum accepted frame size
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl Default for GraphCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for GraphCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let Some(payload) = frame::take_frame(src, self.max_frame_len)? else {
            return Ok(None);
        };

        bincode::deserialize(&payload)
            .map(Some)
            .map_err(|e| CodecError::Parse(format!("bincode decode failed: {}", e)))
    }
}

impl Encoder<Message> for GraphCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(&item)
            .map_err(|e| CodecError::Protocol(format!("bincode encode failed: {}", e)))?;
        frame::put_frame(dst, &payload, self.max_frame_len)
    }
}
