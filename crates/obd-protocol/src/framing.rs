//! Prompt Framing
//!
//! The ELM327 terminates every reply with a `>` prompt. [`PromptFramer`]
//! turns the arbitrary chunks a stream delivers into one frame per prompt.

use tracing::{trace, warn};

/// Prompt character that ends every adapter reply
pub const PROMPT: u8 = b'>';

/// Default upper bound for a partial frame
const MAX_FRAME_BYTES: usize = 4096;

/// Accumulates stream bytes and splits them at the prompt
#[derive(Debug)]
pub struct PromptFramer {
    buf: Vec<u8>,
    max_len: usize,
}

impl PromptFramer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_FRAME_BYTES)
    }

    /// Create a framer that resets after `max_len` bytes without a prompt
    pub fn with_capacity(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            max_len,
        }
    }

    /// Feed received bytes, returning every frame they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in bytes {
            match byte {
                // Some adapters emit NULs around the prompt
                0 => {}
                PROMPT => {
                    let frame = std::mem::take(&mut self.buf);
                    trace!("Framed reply of {} bytes", frame.len());
                    frames.push(frame);
                }
                _ => {
                    if self.buf.len() >= self.max_len {
                        warn!(
                            len = self.buf.len(),
                            "Reply exceeded {} bytes without prompt, resetting", self.max_len
                        );
                        self.buf.clear();
                    }
                    self.buf.push(byte);
                }
            }
        }

        frames
    }

    /// Bytes received since the last prompt
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for PromptFramer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_split_across_chunks() {
        let mut framer = PromptFramer::new();
        assert!(framer.push(b"41 0C ").is_empty());
        assert_eq!(framer.pending(), 6);

        let frames = framer.push(b"1A F8\r\r>");
        assert_eq!(frames, vec![b"41 0C 1A F8\r\r".to_vec()]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut framer = PromptFramer::new();
        let frames = framer.push(b"OK\r>ELM327 v1.5\r>41");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], b"ELM327 v1.5\r".to_vec());
        assert_eq!(framer.pending(), 2);
    }

    #[test]
    fn test_nul_dropped_and_overflow_resets() {
        let mut framer = PromptFramer::with_capacity(4);
        assert!(framer.push(b"\0ABCD").is_empty());
        assert_eq!(framer.pending(), 4);
        assert_eq!(framer.push(b"E>"), vec![b"E".to_vec()]);
    }
}
