//! Wire codec for the broadcast bus and the local UI socket.
//!
//! Length-prefixed JSON frames:
//!
//! ```text
//! [u32 LE length] [payload: length bytes of UTF-8 JSON]
//! ```
//!
//! The decoder is a two-phase state machine. It accumulates bytes until the
//! 4-byte prefix is available, consumes it, then accumulates until the
//! declared payload length is available, parses it and starts over. Input
//! may be split at any byte offset and one delivery may hold many frames.
//!
//! Two ceilings are enforced independently:
//! - a declared length above `max_frame` is rejected as soon as the prefix
//!   is read, before any payload byte is buffered;
//! - more than `max_buffered` undecoded bytes is rejected on delivery.
//!
//! Either violation is a protocol error; callers drop the connection.

use bytes::{Buf, BytesMut};
use serde_json::Value;

use crate::constants::{MAX_BUFFERED_BYTES, MAX_FRAME_SIZE};

/// Length prefix size in bytes.
const PREFIX_LEN: usize = 4;

/// Protocol violations detected while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Declared (or encoded) payload exceeds the single-frame ceiling.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge {
        /// Declared payload length.
        len: usize,
        /// Configured ceiling.
        max: usize,
    },
    /// Undecoded bytes exceed the buffer ceiling.
    #[error("decoder buffer overflow: {buffered} bytes pending (max {max})")]
    BufferOverflow {
        /// Bytes that would be held.
        buffered: usize,
        /// Configured ceiling.
        max: usize,
    },
    /// Payload is not valid UTF-8 JSON.
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Encode a JSON value as one frame.
///
/// Returns `[u32 LE length][payload]`.
pub fn encode_frame(value: &Value) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(value)?;
    encode_payload(&payload)
}

/// Wrap already-serialized payload bytes in a length prefix.
pub fn encode_payload(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let length = payload.len() as u32;
    let mut buf = Vec::with_capacity(PREFIX_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decoder phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the 4-byte length prefix.
    ReadingLength,
    /// Prefix consumed; waiting for `len` payload bytes.
    ReadingPayload { len: usize },
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and collect the complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    state: DecodeState,
    max_frame: usize,
    max_buffered: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default ceilings.
    pub fn new() -> Self {
        Self::with_limits(MAX_FRAME_SIZE, MAX_BUFFERED_BYTES)
    }

    /// Create a decoder with explicit frame and buffer ceilings.
    pub fn with_limits(max_frame: usize, max_buffered: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            state: DecodeState::ReadingLength,
            max_frame,
            max_buffered,
        }
    }

    /// Feed bytes into the decoder and extract all complete messages.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a ceiling is exceeded or a payload is not JSON.
    /// The decoder must not be reused after an error.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<Vec<Value>, FrameError> {
        let mut messages = Vec::new();
        loop {
            match self.state {
                DecodeState::ReadingLength if self.buf.len() == PREFIX_LEN => {
                    let len = self.buf.get_u32_le() as usize;
                    if len > self.max_frame {
                        return Err(FrameError::FrameTooLarge {
                            len,
                            max: self.max_frame,
                        });
                    }
                    self.state = DecodeState::ReadingPayload { len };
                    continue;
                }
                DecodeState::ReadingPayload { len } if self.buf.len() == len => {
                    let payload = self.buf.split_to(len);
                    self.state = DecodeState::ReadingLength;
                    messages.push(serde_json::from_slice(&payload)?);
                    continue;
                }
                _ => {}
            }
            if bytes.is_empty() {
                break;
            }

            // Only take what the current phase needs, so a bad prefix is
            // rejected before any of its payload is held.
            let want = match self.state {
                DecodeState::ReadingLength => PREFIX_LEN,
                DecodeState::ReadingPayload { len } => len,
            };
            let take = (want - self.buf.len()).min(bytes.len());
            let buffered = self.buf.len() + take;
            if buffered > self.max_buffered {
                return Err(FrameError::BufferOverflow {
                    buffered,
                    max: self.max_buffered,
                });
            }
            self.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }

        Ok(messages)
    }

    /// Returns true if a frame is partially received.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || matches!(self.state, DecodeState::ReadingPayload { .. })
    }

    /// Bytes currently held without forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
