//! Frame struct with typed accessors.
//!
//! A logical message may arrive as several frames. The first frame carries
//! the header (if any) and the lengths from the prelude; continuation frames
//! carry only more payload. Exactly one frame per message has `is_last` set.
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use flowwire::protocol::{encode_frame, Frame};
//! use bytes::Bytes;
//!
//! let frame = Frame::message(Some(Bytes::from_static(b"{}")), Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.header_length, 2);
//! assert_eq!(frame.payload_length, 5);
//! assert!(frame.is_last);
//! assert_eq!(encode_frame(&frame).len(), 12 + 2 + 5);
//! ```

use bytes::Bytes;

use super::wire_format::{Prelude, PRELUDE_SIZE};

/// One decoded unit of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Header length from the prelude; 0 on continuation frames.
    pub header_length: u32,
    /// Total payload length of the logical message.
    pub payload_length: u64,
    /// Header bytes, present only on the frame that carries them.
    pub header: Option<Bytes>,
    /// Payload bytes carried by this frame.
    pub payload: Bytes,
    /// Terminal frame of the logical message.
    pub is_last: bool,
}

impl Frame {
    /// Build a frame holding a complete logical message.
    ///
    /// An empty header is normalized to `None`.
    pub fn message(header: Option<Bytes>, payload: Bytes) -> Self {
        let header = header.filter(|h| !h.is_empty());
        Self {
            header_length: header.as_ref().map_or(0, |h| h.len() as u32),
            payload_length: payload.len() as u64,
            header,
            payload,
            is_last: true,
        }
    }

    /// Build a frame that opens a message whose payload continues in later frames.
    pub(crate) fn opening(header: Option<Bytes>, payload_length: u64, payload: Bytes) -> Self {
        let header = header.filter(|h| !h.is_empty());
        let is_last = payload.len() as u64 == payload_length;
        Self {
            header_length: header.as_ref().map_or(0, |h| h.len() as u32),
            payload_length,
            header,
            payload,
            is_last,
        }
    }

    /// Build a continuation frame carrying more payload of the current message.
    pub(crate) fn continuation(payload_length: u64, payload: Bytes, is_last: bool) -> Self {
        Self {
            header_length: 0,
            payload_length,
            header: None,
            payload,
            is_last,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the header bytes, if this frame carries them.
    #[inline]
    pub fn header(&self) -> Option<&[u8]> {
        self.header.as_deref()
    }

    /// Check if this frame carries a header.
    #[inline]
    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }

    /// Prelude describing the message this frame belongs to.
    #[inline]
    pub fn prelude(&self) -> Prelude {
        Prelude::new(self.header_length, self.payload_length)
    }
}

/// Encode a frame that opens a message as a single byte vector.
///
/// Writes the prelude, the header bytes and the payload carried by this
/// frame into one contiguous buffer. Used for UDP datagrams, where a message
/// must fit one packet. The writer streams larger TCP payloads instead.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let header = frame.header().unwrap_or_default();
    let mut buf = Vec::with_capacity(PRELUDE_SIZE + header.len() + frame.payload.len());
    buf.extend_from_slice(&frame.prelude().encode());
    buf.extend_from_slice(header);
    buf.extend_from_slice(&frame.payload);
    buf
}

/// Encode a complete message from raw header and payload slices.
pub fn encode_message(header: &[u8], payload: &[u8]) -> Vec<u8> {
    let prelude = Prelude::new(header.len() as u32, payload.len() as u64);
    let mut buf = Vec::with_capacity(PRELUDE_SIZE + header.len() + payload.len());
    buf.extend_from_slice(&prelude.encode());
    buf.extend_from_slice(header);
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_frame() {
        let frame = Frame::message(Some(Bytes::from_static(b"{\"a\":\"b\"}")), Bytes::from_static(b"hello"));

        assert_eq!(frame.header_length, 9);
        assert_eq!(frame.payload_length, 5);
        assert_eq!(frame.payload(), b"hello");
        assert!(frame.has_header());
        assert!(frame.is_last);
    }

    #[test]
    fn test_empty_header_normalized() {
        let frame = Frame::message(Some(Bytes::new()), Bytes::from_static(b"x"));
        assert_eq!(frame.header_length, 0);
        assert!(frame.header.is_none());
    }

    #[test]
    fn test_opening_frame_is_last_when_complete() {
        let partial = Frame::opening(None, 10, Bytes::from_static(b"abc"));
        assert!(!partial.is_last);

        let whole = Frame::opening(None, 3, Bytes::from_static(b"abc"));
        assert!(whole.is_last);
    }

    #[test]
    fn test_continuation_has_no_header() {
        let frame = Frame::continuation(10, Bytes::from_static(b"rest"), true);
        assert_eq!(frame.header_length, 0);
        assert!(frame.header().is_none());
        assert_eq!(frame.payload_length, 10);
    }

    #[test]
    fn test_encode_frame_layout() {
        let frame = Frame::message(Some(Bytes::from_static(b"hd")), Bytes::from_static(b"hello"));
        let bytes = encode_frame(&frame);

        assert_eq!(bytes.len(), PRELUDE_SIZE + 2 + 5);
        assert_eq!(Prelude::decode(&bytes).unwrap(), Prelude::new(2, 5));
        assert_eq!(&bytes[PRELUDE_SIZE..PRELUDE_SIZE + 2], b"hd");
        assert_eq!(&bytes[PRELUDE_SIZE + 2..], b"hello");
    }

    #[test]
    fn test_encode_message_matches_encode_frame() {
        let frame = Frame::message(Some(Bytes::from_static(b"h")), Bytes::from_static(b"p"));
        assert_eq!(encode_message(b"h", b"p"), encode_frame(&frame));
    }

    #[test]
    fn test_encode_empty_message() {
        let bytes = encode_message(b"", b"");
        assert_eq!(bytes, vec![0u8; PRELUDE_SIZE]);
    }
}
