//! Async frame reader over a byte stream.
//!
//! Wraps any `AsyncRead` with a [`FrameDecoder`] and yields frames one at a
//! time. The sequence is lazy and not restartable: once the stream ends or
//! errors, the reader is exhausted.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Frame, FrameDecoder};
use crate::error::Result;

/// Default socket read buffer (64 KiB).
pub const DEFAULT_READ_BUFFER: usize = 64 * 1024;

/// Lazy frame sequence decoded from an async reader.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    buf: Vec<u8>,
    pending: VecDeque<Frame>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default decoder limits.
    pub fn new(reader: R) -> Self {
        Self::with_decoder(reader, FrameDecoder::new())
    }

    /// Create a reader with a configured decoder.
    pub fn with_decoder(reader: R, decoder: FrameDecoder) -> Self {
        Self {
            reader,
            decoder,
            buf: vec![0u8; DEFAULT_READ_BUFFER],
            pending: VecDeque::new(),
            done: false,
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` at a clean end of stream. Returns a `Framing`
    /// error if the stream ends inside a message or a length is rejected.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if self.done {
                return Ok(None);
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                self.done = true;
                self.decoder.finish()?;
                return Ok(None);
            }

            match self.decoder.push(&self.buf[..n]) {
                Ok(frames) => self.pending.extend(frames),
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
    }
}
