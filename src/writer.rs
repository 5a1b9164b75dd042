//! Outbound message encoding onto a byte stream.
//!
//! A message goes out as prelude, header and the first payload chunk in a
//! single vectored write, followed by the rest of the payload streamed from
//! its source in `chunk_size` pieces. The payload is never materialized as a
//! whole, so artifacts larger than memory can be sent.
//!
//! # Layout
//!
//! ```text
//! write_vectored ─► [prelude 12B][header N B][payload chunk 0]
//! write_all      ─► [payload chunk 1]
//! write_all      ─► [payload chunk 2] ...
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FlowError, Result};
use crate::protocol::{Prelude, PRELUDE_SIZE};

/// Default payload chunk size (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Prelude, header and first payload chunk of a message, written together.
#[derive(Debug)]
struct OpeningFrame {
    prelude: [u8; PRELUDE_SIZE],
    header: Bytes,
    first_chunk: Bytes,
}

impl OpeningFrame {
    fn new(header: Bytes, payload_length: u64, first_chunk: Bytes) -> Self {
        let prelude = Prelude::new(header.len() as u32, payload_length);
        Self {
            prelude: prelude.encode(),
            header,
            first_chunk,
        }
    }

    /// Total size of this write (prelude + header + first chunk).
    #[inline]
    fn size(&self) -> usize {
        PRELUDE_SIZE + self.header.len() + self.first_chunk.len()
    }

    fn parts(&self) -> [&[u8]; 3] {
        [&self.prelude, &self.header, &self.first_chunk]
    }
}

/// Write one message, streaming `payload_length` bytes from `source`.
///
/// Fails with a `Send` error if the source ends before `payload_length`
/// bytes were produced. Returns the number of bytes written.
pub async fn write_message<W, R>(
    writer: &mut W,
    header: Bytes,
    payload_length: u64,
    source: &mut R,
    chunk_size: usize,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let mut buf = vec![0u8; chunk_size];

    let first_len = (payload_length.min(chunk_size as u64)) as usize;
    let first = read_up_to(source, &mut buf[..first_len]).await?;
    if first < first_len {
        return Err(short_source(first as u64, payload_length));
    }

    let opening = OpeningFrame::new(header, payload_length, Bytes::copy_from_slice(&buf[..first]));
    let mut written = opening.size() as u64;
    write_opening(writer, &opening).await?;

    let mut sent = first as u64;
    while sent < payload_length {
        let want = ((payload_length - sent).min(chunk_size as u64)) as usize;
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(short_source(sent, payload_length));
        }
        writer.write_all(&buf[..n]).await?;
        sent += n as u64;
        written += n as u64;
    }

    writer.flush().await?;
    Ok(written)
}

fn short_source(sent: u64, expected: u64) -> FlowError {
    FlowError::Send(format!(
        "payload source ended after {} of {} bytes",
        sent, expected
    ))
}

/// Fill `buf` from `source`, stopping early only at end of input.
async fn read_up_to<R: AsyncRead + Unpin>(source: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write the opening frame with scatter/gather I/O (write_vectored), so
/// prelude, header and first chunk usually leave in one syscall.
async fn write_opening<W>(writer: &mut W, opening: &OpeningFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size = opening.size();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(opening, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(FlowError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn remaining_slices(opening: &OpeningFrame, skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(3);
    let mut offset = 0;

    for part in opening.parts() {
        if part.is_empty() {
            continue;
        }
        let end = offset + part.len();
        if skip_bytes < end {
            let start_in_part = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&part[start_in_part..]));
        }
        offset = end;
    }

    slices
}
