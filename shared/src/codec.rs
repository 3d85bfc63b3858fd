//! Wear link framing
//!
//! Each message from the wearable carries a path and a payload:
//! ```text
//! [ u32 BE: body length ][ u16 BE: path length ][ path (UTF-8) ][ payload ]
//! ```
//!
//! The body length counts the path length field, the path and the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;
use thiserror::Error;

/// Largest accepted body; command payloads are a few dozen bytes
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024;

const LEN_PREFIX: usize = 4;
const PATH_PREFIX: usize = 2;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Frame body of {0} bytes exceeds {MAX_MESSAGE_SIZE}")]
    MessageTooLarge(usize),

    #[error("Bad frame length: {0}")]
    InvalidLength(u32),

    #[error("Path length {path_len} does not fit a {frame_len} byte body")]
    InvalidPathLength { path_len: usize, frame_len: usize },

    #[error("Frame path is not UTF-8: {0}")]
    InvalidPath(#[from] str::Utf8Error),
}

/// One message received over the wear link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WearFrame {
    /// Message path, e.g. `/unustasis/command`
    pub path: String,
    pub data: Bytes,
}

impl WearFrame {
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

pub fn encode(frame: &WearFrame) -> Result<Bytes, CodecError> {
    let mut out = BytesMut::new();
    encode_into(frame, &mut out)?;
    Ok(out.freeze())
}

/// Append the framed message to `out`
pub fn encode_into(frame: &WearFrame, out: &mut BytesMut) -> Result<(), CodecError> {
    let path_len = u16::try_from(frame.path.len())
        .map_err(|_| CodecError::MessageTooLarge(frame.path.len()))?;
    let body = PATH_PREFIX + frame.path.len() + frame.data.len();
    if body > MAX_MESSAGE_SIZE as usize {
        return Err(CodecError::MessageTooLarge(body));
    }

    out.reserve(LEN_PREFIX + body);
    out.put_u32(body as u32);
    out.put_u16(path_len);
    out.extend_from_slice(frame.path.as_bytes());
    out.extend_from_slice(&frame.data);
    Ok(())
}

/// Body length announced at the front of `buf`, once the prefix is complete
fn announced_len(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    let Some(prefix) = buf.get(..LEN_PREFIX) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    if !(PATH_PREFIX as u32..=MAX_MESSAGE_SIZE).contains(&len) {
        return Err(CodecError::InvalidLength(len));
    }
    Ok(Some(len as usize))
}

/// Take one frame off the front of `buf`. Leaves `buf` untouched and returns
/// `Ok(None)` while the frame is incomplete.
pub fn decode(buf: &mut BytesMut) -> Result<Option<WearFrame>, CodecError> {
    let Some(frame_len) = announced_len(buf)? else {
        return Ok(None);
    };
    if buf.len() < LEN_PREFIX + frame_len {
        return Ok(None);
    }

    buf.advance(LEN_PREFIX);
    let mut body = buf.split_to(frame_len);
    let path_len = body.get_u16() as usize;
    if path_len > body.len() {
        return Err(CodecError::InvalidPathLength {
            path_len,
            frame_len,
        });
    }
    let path = str::from_utf8(&body.split_to(path_len))?.to_owned();

    Ok(Some(WearFrame {
        path,
        data: body.freeze(),
    }))
}

/// Reassembles frames from a byte stream read in arbitrary chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            pending: BytesMut::with_capacity(256),
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Next complete frame, `Ok(None)` once the buffer holds only a partial one
    pub fn decode_next(&mut self) -> Result<Option<WearFrame>, CodecError> {
        decode(&mut self.pending)
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffer_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/unustasis/command";

    fn lock_frame() -> WearFrame {
        WearFrame::new(PATH, &b"unustasis://lock"[..])
    }

    #[test]
    fn test_wire_layout() {
        let wire = encode(&lock_frame()).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&(2 + 18 + 16u32).to_be_bytes());
        expected.extend_from_slice(&18u16.to_be_bytes());
        expected.extend_from_slice(PATH.as_bytes());
        expected.extend_from_slice(b"unustasis://lock");
        assert_eq!(&wire[..], &expected[..]);
    }

    #[test]
    fn test_incomplete_frame_is_left_in_place() {
        let wire = encode(&lock_frame()).unwrap();

        for cut in [0, 3, 4, 6, wire.len() - 1] {
            let mut buf = BytesMut::from(&wire[..cut]);
            assert!(decode(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_decoder_reassembles_byte_by_byte() {
        let mut wire = encode(&lock_frame()).unwrap().to_vec();
        wire.extend_from_slice(&encode(&WearFrame::new("/ping", Bytes::new())).unwrap());

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &wire {
            decoder.extend(std::slice::from_ref(byte));
            while let Some(frame) = decoder.decode_next().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], lock_frame());
        assert_eq!(frames[1].path, "/ping");
        assert!(frames[1].data.is_empty());
        assert_eq!(decoder.buffer_len(), 0);
    }

    #[test]
    fn test_rejects_bad_lengths() {
        let mut oversized = BytesMut::new();
        oversized.put_u32(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(
            decode(&mut oversized),
            Err(CodecError::InvalidLength(_))
        ));

        let mut no_path_len = BytesMut::new();
        no_path_len.put_u32(1);
        no_path_len.put_u8(0);
        assert!(matches!(
            decode(&mut no_path_len),
            Err(CodecError::InvalidLength(1))
        ));

        let mut long_path = BytesMut::new();
        long_path.put_u32(4);
        long_path.put_u16(10);
        long_path.put_slice(b"ab");
        assert!(matches!(
            decode(&mut long_path),
            Err(CodecError::InvalidPathLength {
                path_len: 10,
                frame_len: 4
            })
        ));
    }

    #[test]
    fn test_rejects_non_utf8_path_and_oversized_encode() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u16(2);
        buf.put_slice(&[0xc3, 0x28]);
        assert!(matches!(decode(&mut buf), Err(CodecError::InvalidPath(_))));

        let big = WearFrame::new(PATH, vec![0u8; MAX_MESSAGE_SIZE as usize]);
        assert!(matches!(encode(&big), Err(CodecError::MessageTooLarge(_))));
    }
}
