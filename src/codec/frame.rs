//! Length-prefix framing shared by both codecs
//!
//! Layout:
//! - 4 bytes: payload length (u32, big-endian)
//! - N bytes: payload

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

/// Maximum accepted payload size (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Split one complete frame payload off the front of `src`.
///
/// Returns `Ok(None)` until the whole frame is buffered; bytes belonging to
/// the next frame stay in `src`.
pub fn take_frame(src: &mut BytesMut, max_len: usize) -> Result<Option<BytesMut>, CodecError> {
    if src.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }

    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    len_buf.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_len {
        return Err(CodecError::Protocol(format!(
            "frame length {} exceeds maximum {}",
            len, max_len
        )));
    }

    let total = LENGTH_PREFIX_LEN + len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_LEN);
    Ok(Some(src.split_to(len)))
}

/// Append one length-prefixed frame to `dst`.
pub fn put_frame(dst: &mut BytesMut, payload: &[u8], max_len: usize) -> Result<(), CodecError> {
    if payload.len() > max_len {
        return Err(CodecError::Protocol(format!(
            "outgoing frame of {} bytes exceeds maximum {}",
            payload.len(),
            max_len
        )));
    }

    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frame_waits() {
        let mut buf = BytesMut::new();
        put_frame(&mut buf, b"hello", MAX_FRAME_LEN).unwrap();
        let mut partial = buf.split_to(6);

        assert!(take_frame(&mut partial, MAX_FRAME_LEN).unwrap().is_none());
        assert_eq!(partial.len(), 6);

        partial.unsplit(buf);
        let frame = take_frame(&mut partial, MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_short_prefix_waits() {
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(take_frame(&mut buf, MAX_FRAME_LEN).unwrap().is_none());
    }

    #[test]
    fn test_one_frame_per_call() {
        let mut buf = BytesMut::new();
        put_frame(&mut buf, b"first", MAX_FRAME_LEN).unwrap();
        put_frame(&mut buf, b"second", MAX_FRAME_LEN).unwrap();

        let first = take_frame(&mut buf, MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!(&first[..], b"first");
        let second = take_frame(&mut buf, MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!(&second[..], b"second");
        assert!(take_frame(&mut buf, MAX_FRAME_LEN).unwrap().is_none());
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        // 0xFFFFFFFF would be a negative length as a signed int
        let mut buf = BytesMut::from(&[0xFFu8, 0xFF, 0xFF, 0xFF, b'x'][..]);
        let err = take_frame(&mut buf, MAX_FRAME_LEN).unwrap_err();
        assert!(matches!(err, CodecError::Protocol(_)));
    }

    #[test]
    fn test_oversized_payload_not_written() {
        let mut buf = BytesMut::new();
        let err = put_frame(&mut buf, &[0u8; 16], 8).unwrap_err();
        assert!(matches!(err, CodecError::Protocol(_)));
        assert!(buf.is_empty());
    }
}
