//! Incremental frame decoder for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented messages:
//! - `AwaitHeaderLen`: Need 4 bytes of header length
//! - `AwaitPayloadLen`: Need 8 bytes of payload length
//! - `AwaitHeader`: Need `header_length` header bytes
//! - `StreamPayload`: Emitting payload bytes as they arrive
//!
//! The decoder never buffers a payload whole: each `push` hands back
//! whatever payload bytes are available as frames. Whether those frames are
//! accumulated is up to the consumer; the session assembler charges them to
//! a shared receive budget.
//!
//! # Example
//!
//! ```ignore
//! use flowwire::protocol::FrameDecoder;
//!
//! let mut decoder = FrameDecoder::new();
//!
//! // Data arrives in chunks from socket
//! let frames = decoder.push(&chunk)?;
//!
//! for frame in frames {
//!     sink.extend_from_slice(frame.payload());
//! }
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{
    decode_header_length, decode_payload_length, validate_header_length, Prelude,
    DEFAULT_MAX_HEADER_LENGTH, DEFAULT_MAX_PAYLOAD_LENGTH, HEADER_LENGTH_SIZE,
    PAYLOAD_LENGTH_SIZE,
};
use super::Frame;
use crate::error::{FlowError, Result};

/// Default read buffer capacity (64 KiB).
const DEFAULT_CAPACITY: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the 4-byte header length.
    AwaitHeaderLen,
    /// Header length known, waiting for the 8-byte payload length.
    AwaitPayloadLen { header_length: u32 },
    /// Both lengths known, waiting for the header bytes.
    AwaitHeader {
        header_length: u32,
        payload_length: u64,
    },
    /// Header delivered, forwarding payload bytes.
    StreamPayload { payload_length: u64, remaining: u64 },
}

/// Decoder turning a byte stream into frames.
pub struct FrameDecoder {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed header size.
    max_header_length: u32,
    /// Maximum allowed payload size.
    max_payload_length: u64,
}

impl FrameDecoder {
    /// Create a new decoder with default limits (1 MiB header, 1 GiB payload).
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_HEADER_LENGTH, DEFAULT_MAX_PAYLOAD_LENGTH)
    }

    /// Create a new decoder with custom limits.
    pub fn with_limits(max_header_length: u32, max_payload_length: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_CAPACITY),
            state: State::AwaitHeaderLen,
            max_header_length,
            max_payload_length,
        }
    }

    /// Push data into the decoder and extract all available frames.
    ///
    /// Partial preludes and headers are buffered internally for the next
    /// push. Available payload bytes are always returned immediately.
    ///
    /// # Errors
    ///
    /// Returns a `Framing` error if a length field exceeds its maximum. The
    /// decoder must not be reused after an error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Signal end of stream.
    ///
    /// Returns a `Framing` error if the stream stopped inside a message.
    pub fn finish(&mut self) -> Result<()> {
        if self.is_mid_message() {
            let state = self.state_name();
            self.clear();
            return Err(FlowError::Framing(format!(
                "stream closed mid-frame ({})",
                state
            )));
        }
        Ok(())
    }

    /// Try to extract a single frame from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match self.state {
            State::AwaitHeaderLen => {
                let Some(header_length) = decode_header_length(&self.buffer) else {
                    return Ok(None);
                };
                validate_header_length(header_length, self.max_header_length)?;
                let _ = self.buffer.split_to(HEADER_LENGTH_SIZE);

                self.state = State::AwaitPayloadLen { header_length };
                self.try_extract_one()
            }

            State::AwaitPayloadLen { header_length } => {
                let Some(payload_length) = decode_payload_length(&self.buffer) else {
                    return Ok(None);
                };
                Prelude::new(header_length, payload_length)
                    .validate(self.max_header_length, self.max_payload_length)?;
                let _ = self.buffer.split_to(PAYLOAD_LENGTH_SIZE);

                self.state = State::AwaitHeader {
                    header_length,
                    payload_length,
                };
                self.try_extract_one()
            }

            State::AwaitHeader {
                header_length,
                payload_length,
            } => {
                let header_length = header_length as usize;
                if self.buffer.len() < header_length {
                    return Ok(None);
                }

                let header = (header_length > 0).then(|| self.buffer.split_to(header_length).freeze());
                let payload = self.take_payload(payload_length);
                let remaining = payload_length - payload.len() as u64;

                self.state = if remaining == 0 {
                    State::AwaitHeaderLen
                } else {
                    State::StreamPayload {
                        payload_length,
                        remaining,
                    }
                };

                Ok(Some(Frame::opening(header, payload_length, payload)))
            }

            State::StreamPayload {
                payload_length,
                remaining,
            } => {
                if self.buffer.is_empty() {
                    return Ok(None);
                }

                let payload = self.take_payload(remaining);
                let remaining = remaining - payload.len() as u64;
                let is_last = remaining == 0;

                self.state = if is_last {
                    State::AwaitHeaderLen
                } else {
                    State::StreamPayload {
                        payload_length,
                        remaining,
                    }
                };

                Ok(Some(Frame::continuation(payload_length, payload, is_last)))
            }
        }
    }

    /// Split off up to `limit` buffered bytes (zero-copy freeze).
    fn take_payload(&mut self, limit: u64) -> Bytes {
        let n = (self.buffer.len() as u64).min(limit) as usize;
        self.buffer.split_to(n).freeze()
    }

    /// Check if the decoder is inside a message.
    pub fn is_mid_message(&self) -> bool {
        self.state != State::AwaitHeaderLen || !self.buffer.is_empty()
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::AwaitHeaderLen;
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            State::AwaitHeaderLen => "AwaitHeaderLen",
            State::AwaitPayloadLen { .. } => "AwaitPayloadLen",
            State::AwaitHeader { .. } => "AwaitHeader",
            State::StreamPayload { .. } => "StreamPayload",
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
