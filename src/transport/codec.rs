//! Frame codec for the MCP stdio wire format.
//!
//! Frame format:
//! ```text
//! ┌──────────────────────────────┬────┐
//! │   UTF-8 JSON (no newlines)   │ \n │
//! └──────────────────────────────┴────┘
//! ```
//! A trailing `\r` before the newline is tolerated and stripped.

use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Reads newline-delimited frames.
///
/// Partial input is kept inside the reader between calls, so
/// [`FrameReader::next_frame`] is cancel-safe and may sit in a `select!`.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    partial: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            partial: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Read one frame without its terminator.
    ///
    /// Returns `None` on clean EOF. EOF in the middle of a frame and frames
    /// larger than `max_frame_bytes` are errors.
    pub async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.partial.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a frame ({} bytes buffered)", self.partial.len()),
                ));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let take = newline.unwrap_or(available.len());
            if self.partial.len() + take > self.max_frame_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Frame too large: exceeds {} bytes", self.max_frame_bytes),
                ));
            }

            // No await between extending and consuming.
            self.partial.extend_from_slice(&available[..take]);
            match newline {
                Some(pos) => {
                    self.reader.consume(pos + 1);
                    let mut frame = std::mem::take(&mut self.partial);
                    if frame.last() == Some(&b'\r') {
                        frame.pop();
                    }
                    return Ok(Some(frame));
                }
                None => self.reader.consume(take),
            }
        }
    }
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.contains(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame payload contains a newline",
        ));
    }
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
