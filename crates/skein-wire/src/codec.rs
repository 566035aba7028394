//! Length-prefixed frame codec
//!
//! Frame = Length (u32, big-endian) + JSON body

use bytes::{Buf, BufMut, Bytes, BytesMut};

use skein_core::{SkeinError, SkeinResult};

use crate::Frame;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum body size accepted on a connection
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Serialize a frame with its length prefix
pub fn encode(frame: &Frame) -> SkeinResult<Bytes> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(SkeinError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Take one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; the buffer is left untouched
/// in that case.
pub fn decode(buf: &mut BytesMut) -> SkeinResult<Option<Frame>> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SkeinError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    if buf.len() < LENGTH_PREFIX_SIZE + len {
        buf.reserve(LENGTH_PREFIX_SIZE + len - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(len);
    let frame = serde_json::from_slice(&body)
        .map_err(|e| SkeinError::InvalidWireFormat(e.to_string()))?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_core::ChannelName;

    fn publish(n: i64) -> Frame {
        Frame::Publish {
            channel: ChannelName::from("sensors"),
            data: json!({ "n": n }),
        }
    }

    #[test]
    fn test_decode_needs_full_frame() {
        let bytes = encode(&publish(1)).unwrap();
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), bytes.len() - 1);

        buf.put_u8(bytes[bytes.len() - 1]);
        assert_eq!(decode(&mut buf).unwrap(), Some(publish(1)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&publish(1)).unwrap());
        buf.extend_from_slice(&encode(&publish(2)).unwrap());

        assert_eq!(decode(&mut buf).unwrap(), Some(publish(1)));
        assert_eq!(decode(&mut buf).unwrap(), Some(publish(2)));
        assert_eq!(decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(
            decode(&mut buf),
            Err(SkeinError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"{{{");
        assert!(matches!(
            decode(&mut buf),
            Err(SkeinError::InvalidWireFormat(_))
        ));
    }
}
