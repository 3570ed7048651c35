//! Bounded scrollback for terminal replay.
//!
//! Holds decoded output chunks up to a byte budget. When full, whole chunks
//! are evicted from the front, so the replay never starts mid-character.
//! A single chunk larger than the budget keeps only its tail, cut at a char
//! boundary.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;

/// Byte-budgeted ring of output chunks.
#[derive(Debug)]
pub struct Scrollback {
    chunks: VecDeque<String>,
    len: usize,
    capacity: usize,
}

impl Scrollback {
    /// Create a scrollback holding at most `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Scrollback capacity must be > 0");
        Self {
            chunks: VecDeque::new(),
            len: 0,
            capacity,
        }
    }

    /// Append `text`, evicting the oldest chunks if needed.
    pub fn push(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }

        if text.len() >= self.capacity {
            self.chunks.clear();
            let mut start = text.len() - self.capacity;
            while !text.is_char_boundary(start) {
                start += 1;
            }
            self.len = text.len() - start;
            self.chunks.push_back(text[start..].to_string());
            return;
        }

        while self.len + text.len() > self.capacity {
            match self.chunks.pop_front() {
                Some(old) => self.len -= old.len(),
                None => break,
            }
        }
        self.len += text.len();
        self.chunks.push_back(text.to_string());
    }

    /// Everything buffered, oldest first.
    pub fn snapshot(&self) -> String {
        let mut out = String::with_capacity(self.len);
        for chunk in &self.chunks {
            out.push_str(chunk);
        }
        out
    }

    /// Buffered bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Configured budget in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_snapshot() {
        let mut sb = Scrollback::new(64);
        assert!(sb.is_empty());
        sb.push("$ ls\r\n");
        sb.push("Cargo.toml\r\n");
        assert_eq!(sb.snapshot(), "$ ls\r\nCargo.toml\r\n");
        assert_eq!(sb.len(), 18);
        assert_eq!(sb.capacity(), 64);
    }

    #[test]
    fn test_evicts_whole_chunks_from_front() {
        let mut sb = Scrollback::new(10);
        sb.push("aaaa");
        sb.push("bbbb");
        sb.push("cccc");
        assert_eq!(sb.snapshot(), "bbbbcccc");
        assert!(sb.len() <= sb.capacity());
    }

    #[test]
    fn test_oversized_chunk_keeps_tail_on_char_boundary() {
        let mut sb = Scrollback::new(5);
        sb.push("xx");
        sb.push("abc日本");
        let snap = sb.snapshot();
        assert!(snap.len() <= 5);
        assert_eq!(snap, "本");
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = Scrollback::new(0);
    }
}
