//! Newline-delimited JSON framing for async byte streams.
//!
//! Each frame is one JSON document terminated by `\n`. Partial lines are
//! buffered until the delimiter arrives; a line that fails to parse is
//! skipped and the stream resynchronizes at the next delimiter. Whitespace
//! between frames is tolerated.
//!
//! This module is generic over the transport type: it works with any
//! `AsyncRead + AsyncWrite + Unpin`, including TCP sockets, Unix sockets,
//! and in-memory duplex pipes.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;

const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;

/// Failure to turn one delimited line into a [`Message`].
///
/// The two variants are deliberately distinct kinds: `Framing` means the
/// bytes were not JSON at all (transport corruption), `Invalid` means the
/// JSON was well-formed but violates the message schema (protocol
/// violation). Callers route them differently.
#[derive(Debug)]
pub enum DecodeError {
    /// The line is not a JSON document.
    Framing { detail: String },
    /// Well-formed JSON that is not a valid message.
    Invalid { detail: String },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Framing { detail } => write!(f, "framing error: {detail}"),
            DecodeError::Invalid { detail } => write!(f, "invalid message: {detail}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Error receiving a frame from a [`FramedStream`].
#[derive(Debug)]
pub enum RecvError {
    /// Transport I/O failure; the connection is unusable.
    Io(io::Error),
    /// One bad frame; receiving can continue past the next delimiter.
    Decode(DecodeError),
}

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecvError::Io(e) => write!(f, "io error: {e}"),
            RecvError::Decode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RecvError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecvError::Io(e) => Some(e),
            RecvError::Decode(e) => Some(e),
        }
    }
}

impl From<io::Error> for RecvError {
    fn from(e: io::Error) -> Self {
        RecvError::Io(e)
    }
}

/// Decode one delimited line (without its trailing `\n`).
///
/// Parsing happens in two steps so the failure kinds stay separate: bytes to
/// JSON (`Framing` on failure), then JSON to a schema-checked [`Message`]
/// (`Invalid` on failure).
pub fn decode_line(line: &[u8]) -> Result<Message, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_slice(line).map_err(|e| DecodeError::Framing {
            detail: e.to_string(),
        })?;
    let message: Message = serde_json::from_value(value).map_err(|e| DecodeError::Invalid {
        detail: e.to_string(),
    })?;
    message.validate().map_err(|e| DecodeError::Invalid {
        detail: e.to_string(),
    })?;
    Ok(message)
}

/// Encode one message as a compact JSON line, delimiter included.
pub fn encode(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    Ok(buf)
}

fn is_json_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r')
}

/// A newline-framed message stream over any duplex byte transport.
///
/// Owns the stream and a receive buffer. `unread_start` marks the consumed
/// prefix, `scan_from` the position up to which the buffer has already been
/// scanned for a delimiter, so repeated `recv` calls never rescan bytes.
pub struct FramedStream<S> {
    stream: S,
    buf: Vec<u8>,
    unread_start: usize,
    scan_from: usize,
    /// Buffer for encoding messages to avoid reallocations.
    encode_buf: Vec<u8>,
}

impl<S> FramedStream<S> {
    /// Create a new framed stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            unread_start: 0,
            scan_from: 0,
            encode_buf: Vec::with_capacity(1024),
        }
    }

    /// Get a reference to the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the framed wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn compact_recv_buffer(&mut self) {
        if self.unread_start == self.buf.len() {
            self.buf.clear();
            self.unread_start = 0;
            self.scan_from = 0;
            return;
        }

        if self.unread_start >= RECV_BUF_COMPACT_THRESHOLD && self.unread_start >= self.buf.len() / 2 {
            self.buf.drain(..self.unread_start);
            self.scan_from = self.scan_from.saturating_sub(self.unread_start);
            self.unread_start = 0;
        }
    }

    fn advance_past_line(&mut self, line_end: usize) {
        self.unread_start = line_end + 1;
        self.scan_from = self.unread_start;
        self.compact_recv_buffer();
    }

    /// Decode one message from buffered bytes, if a whole line is available.
    ///
    /// Skips whitespace-only lines. On a bad line the buffer is advanced
    /// past it before the error is returned, so the next call resumes at the
    /// following frame.
    fn try_decode_buffered(&mut self) -> Result<Option<Message>, DecodeError> {
        loop {
            if self.scan_from < self.unread_start {
                self.scan_from = self.unread_start;
            }
            if self.scan_from > self.buf.len() {
                self.scan_from = self.buf.len();
            }

            let Some(rel_idx) = self.buf[self.scan_from..].iter().position(|b| *b == b'\n') else {
                self.scan_from = self.buf.len();
                return Ok(None);
            };

            let line_end = self.scan_from + rel_idx;
            if self.buf[self.unread_start..line_end]
                .iter()
                .all(|b| is_json_whitespace(*b))
            {
                self.advance_past_line(line_end);
                continue;
            }

            let decoded = decode_line(&self.buf[self.unread_start..line_end]);
            self.advance_past_line(line_end);
            return decoded.map(Some);
        }
    }
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send one message as a single frame and flush.
    pub async fn send(&mut self, message: &Message) -> io::Result<()> {
        self.encode_buf.clear();
        serde_json::to_writer(&mut self.encode_buf, message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.encode_buf.push(b'\n');

        tracing::trace!(frame = %String::from_utf8_lossy(&self.encode_buf).trim_end(), "send");
        self.stream.write_all(&self.encode_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` on clean end of stream. A [`RecvError::Decode`]
    /// consumes only the offending line; calling `recv` again continues with
    /// the following frame.
    pub async fn recv(&mut self) -> Result<Option<Message>, RecvError> {
        loop {
            if let Some(message) = self.try_decode_buffered().map_err(RecvError::Decode)? {
                return Ok(Some(message));
            }

            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                let trailing = &self.buf[self.unread_start.min(self.buf.len())..];
                if trailing.iter().all(|b| is_json_whitespace(*b)) {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "eof with {} trailing bytes and no frame delimiter",
                        trailing.len()
                    ),
                )
                .into());
            }
            self.compact_recv_buffer();
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }
}
