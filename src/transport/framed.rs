//! Length-prefixed framing over a byte stream.
//!
//! # Example
//!
//! ```ignore
//! use instrument_relay::transport::FramedConnection;
//!
//! let mut conn = FramedConnection::new(stream);
//! conn.send(b"G:").await?;
//! let reply = conn.receive().await?;
//! ```

use std::collections::VecDeque;
use std::io::{ErrorKind, IoSlice};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::{FrameBuffer, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};

/// Socket read chunk size.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A stream that sends and receives whole frames.
///
/// One reader and one writer at a time: both directions take `&mut self`.
pub struct FramedConnection<S> {
    stream: S,
    buffer: FrameBuffer,
    /// Frames already parsed but not yet returned.
    ready: VecDeque<Bytes>,
    read_buf: Vec<u8>,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream using the default maximum frame size.
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_size(stream, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Wrap a stream, rejecting incoming frames larger than `max_frame_size`.
    pub fn with_max_frame_size(stream: S, max_frame_size: u32) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::with_max_payload(max_frame_size),
            ready: VecDeque::new(),
            read_buf: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Write `payload` as one frame and flush.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let header = Header::for_payload(payload)?.encode();
        write_frame(&mut self.stream, &header, payload).await
    }

    /// Receive one complete frame.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the peer ends the stream, at a frame boundary or not
    /// - `Malformed` if the declared frame size exceeds the maximum
    pub async fn receive(&mut self) -> Result<Bytes> {
        self.receive_or_eof().await?.ok_or(Error::ConnectionClosed)
    }

    /// Receive one complete frame, or `None` if the peer closed the stream
    /// cleanly between frames.
    pub async fn receive_or_eof(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.stream.read(&mut self.read_buf).await.map_err(read_error)?;
            if n == 0 {
                if self.buffer.is_mid_frame() {
                    return Err(Error::ConnectionClosed);
                }
                return Ok(None);
            }

            self.ready.extend(self.buffer.push(&self.read_buf[..n])?);
        }
    }

    /// Shut down the write half of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

fn read_error(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            Error::ConnectionClosed
        }
        _ => Error::Io(e),
    }
}

/// Write header and payload with scatter/gather I/O (write_vectored).
///
/// Falls back to continuing from the first unwritten byte when the stream
/// accepts only part of the data.
async fn write_frame<W>(writer: &mut W, header: &[u8; HEADER_SIZE], payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size = HEADER_SIZE + payload.len();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(header, payload, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after `skip_bytes`.
fn remaining_slices<'a>(
    header: &'a [u8; HEADER_SIZE],
    payload: &'a [u8],
    skip_bytes: usize,
) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(2);

    if skip_bytes < HEADER_SIZE {
        slices.push(IoSlice::new(&header[skip_bytes..]));
    }

    let payload_skip = skip_bytes.saturating_sub(HEADER_SIZE);
    if payload_skip < payload.len() {
        slices.push(IoSlice::new(&payload[payload_skip..]));
    }

    slices
}
