//! Wire format encoding and decoding.
//!
//! Every logical message starts with a 12-byte prelude:
//! ```text
//! ┌───────────────┬────────────────┬──────────────┬─────────────────┐
//! │ Header length │ Payload length │ Header bytes │ Payload bytes   │
//! │ 4 bytes       │ 8 bytes        │ N bytes      │ M bytes         │
//! │ uint32 BE     │ uint64 BE      │ (JSON attrs) │ (opaque content)│
//! └───────────────┴────────────────┴──────────────┴─────────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. A header length of zero means the
//! message carries no attributes.

use crate::error::{FlowError, Result};

/// Size of the header length field.
pub const HEADER_LENGTH_SIZE: usize = 4;

/// Size of the payload length field.
pub const PAYLOAD_LENGTH_SIZE: usize = 8;

/// Prelude size in bytes (fixed, exactly 12).
pub const PRELUDE_SIZE: usize = HEADER_LENGTH_SIZE + PAYLOAD_LENGTH_SIZE;

/// Default maximum header size (1 MiB).
pub const DEFAULT_MAX_HEADER_LENGTH: u32 = 1024 * 1024;

/// Default maximum payload size (1 GiB).
pub const DEFAULT_MAX_PAYLOAD_LENGTH: u64 = 1_073_741_824;

/// Length fields that precede each message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prelude {
    /// Number of header bytes that follow the prelude.
    pub header_length: u32,
    /// Number of payload bytes that follow the header.
    pub payload_length: u64,
}

impl Prelude {
    /// Create a new prelude.
    pub fn new(header_length: u32, payload_length: u64) -> Self {
        Self {
            header_length,
            payload_length,
        }
    }

    /// Encode prelude to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use flowwire::protocol::Prelude;
    ///
    /// let bytes = Prelude::new(2, 5).encode();
    /// assert_eq!(bytes.len(), 12);
    /// assert_eq!(&bytes[..4], &[0, 0, 0, 2]);
    /// ```
    pub fn encode(&self) -> [u8; PRELUDE_SIZE] {
        let mut buf = [0u8; PRELUDE_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode prelude into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `PRELUDE_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= PRELUDE_SIZE);
        buf[..HEADER_LENGTH_SIZE].copy_from_slice(&self.header_length.to_be_bytes());
        buf[HEADER_LENGTH_SIZE..PRELUDE_SIZE].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Decode prelude from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let header_length = decode_header_length(buf)?;
        let payload_length = decode_payload_length(buf.get(HEADER_LENGTH_SIZE..)?)?;
        Some(Self {
            header_length,
            payload_length,
        })
    }

    /// Check both length fields against configured maxima.
    pub fn validate(&self, max_header_length: u32, max_payload_length: u64) -> Result<()> {
        validate_header_length(self.header_length, max_header_length)?;
        validate_payload_length(self.payload_length, max_payload_length)
    }
}

/// Read the 4-byte header length field.
#[inline]
pub fn decode_header_length(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; HEADER_LENGTH_SIZE] = buf.get(..HEADER_LENGTH_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Read the 8-byte payload length field.
#[inline]
pub fn decode_payload_length(buf: &[u8]) -> Option<u64> {
    let bytes: [u8; PAYLOAD_LENGTH_SIZE] = buf.get(..PAYLOAD_LENGTH_SIZE)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Reject a header length above the configured maximum.
pub fn validate_header_length(header_length: u32, max: u32) -> Result<()> {
    if header_length > max {
        return Err(FlowError::Framing(format!(
            "Header length {} exceeds maximum {}",
            header_length, max
        )));
    }
    Ok(())
}

/// Reject a payload length above the configured maximum.
pub fn validate_payload_length(payload_length: u64, max: u64) -> Result<()> {
    if payload_length > max {
        return Err(FlowError::Framing(format!(
            "Payload length {} exceeds maximum {}",
            payload_length, max
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_encode_decode_roundtrip() {
        let original = Prelude::new(17, 1_000_000);
        let decoded = Prelude::decode(&original.encode()).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_prelude_big_endian_byte_order() {
        let bytes = Prelude::new(0x01020304, 0x05060708090A0B0C).encode();
        assert_eq!(
            bytes,
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C]
        );
    }

    #[test]
    fn test_prelude_size_is_exactly_12() {
        assert_eq!(PRELUDE_SIZE, 12);
        assert_eq!(Prelude::new(0, 0).encode().len(), 12);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Prelude::decode(&[0u8; 11]).is_none());
        assert!(decode_header_length(&[0u8; 3]).is_none());
        assert_eq!(decode_header_length(&[0, 0, 1, 0]), Some(256));
    }

    #[test]
    fn test_validate_header_too_large() {
        let result = Prelude::new(101, 0).validate(100, DEFAULT_MAX_PAYLOAD_LENGTH);
        let err = result.unwrap_err();
        assert!(matches!(err, FlowError::Framing(_)));
        assert!(err.to_string().contains("Header length 101 exceeds maximum 100"));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let result = Prelude::new(0, 2_000).validate(DEFAULT_MAX_HEADER_LENGTH, 1_000);
        assert!(result.unwrap_err().to_string().contains("Payload length"));
    }

    #[test]
    fn test_validate_at_limit_allowed() {
        assert!(Prelude::new(100, 1_000).validate(100, 1_000).is_ok());
    }
}
