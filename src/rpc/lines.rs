//! Newline-delimited JSON reader.
//!
//! Bytes arrive in arbitrary chunks. Complete lines are parsed as JSON;
//! a line that fails to parse is logged and dropped without disturbing the
//! lines around it. A single line longer than the ceiling is discarded up to
//! its terminating newline.

use serde_json::Value;

use crate::constants::MAX_BUFFERED_BYTES;

/// Accumulates bytes and yields one JSON value per complete line.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line: usize,
    /// Skipping the tail of an oversized line.
    discarding: bool,
}

impl LineBuffer {
    /// Buffer with the default line ceiling.
    pub fn new() -> Self {
        Self::with_max_line(MAX_BUFFERED_BYTES)
    }

    /// Buffer with an explicit line ceiling.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    /// Feed a chunk and return every JSON value completed by it.
    pub fn push(&mut self, mut bytes: &[u8]) -> Vec<Value> {
        let mut values = Vec::new();

        while let Some(pos) = bytes.iter().position(|&b| b == b'\n') {
            let (head, rest) = bytes.split_at(pos);
            bytes = &rest[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            self.buf.extend_from_slice(head);
            let line = std::mem::take(&mut self.buf);
            if let Some(value) = parse_line(&line) {
                values.push(value);
            }
        }

        if !self.discarding {
            self.buf.extend_from_slice(bytes);
            if self.buf.len() > self.max_line {
                log::warn!(
                    "[Rpc] Discarding line longer than {} bytes",
                    self.max_line
                );
                self.buf.clear();
                self.discarding = true;
            }
        }

        values
    }

    /// Parse whatever is left when the stream ends without a final newline.
    pub fn finish(&mut self) -> Option<Value> {
        let line = std::mem::take(&mut self.buf);
        if self.discarding {
            self.discarding = false;
            return None;
        }
        parse_line(&line)
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_line(line: &[u8]) -> Option<Value> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    match serde_json::from_slice(line) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!(
                "[Rpc] Dropping invalid JSON line ({e}): {}",
                String::from_utf8_lossy(&line[..line.len().min(200)])
            );
            None
        }
    }
}
