//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary framing protocol:
//! - 12-byte prelude encoding/decoding
//! - Incremental decoder for accumulating partial reads
//! - Frame struct and async frame reader

mod decoder;
mod frame;
mod reader;
mod wire_format;

pub use decoder::FrameDecoder;
pub use frame::{encode_frame, encode_message, Frame};
pub use reader::{FrameReader, DEFAULT_READ_BUFFER};
pub use wire_format::{
    decode_header_length, decode_payload_length, validate_header_length,
    validate_payload_length, Prelude, DEFAULT_MAX_HEADER_LENGTH, DEFAULT_MAX_PAYLOAD_LENGTH,
    HEADER_LENGTH_SIZE, PAYLOAD_LENGTH_SIZE, PRELUDE_SIZE,
};
