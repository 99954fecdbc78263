//! NDJSON framing.
//!
//! Stream transports delimit messages with a single `\n`. The codec
//! accumulates raw bytes, yields complete frames, trims trailing `\r`,
//! skips empty lines, and enforces a message-size cap so a misbehaving
//! peer cannot grow the buffer without bound. Frames stay raw: the
//! dispatcher classifies and parses them.

use peermcp_core::{McpError, McpResult};

/// Compact the buffer once consumed bytes exceed this threshold.
const COMPACT_THRESHOLD: usize = 4096;

/// Default maximum message size: 10 MiB.
const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Incremental NDJSON frame codec.
#[derive(Debug)]
pub struct Codec {
    buffer: Vec<u8>,
    read_pos: usize,
    max_message_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    /// Creates a codec with the default 10 MiB message-size cap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            read_pos: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Returns the maximum allowed message size in bytes.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Sets the maximum allowed message size in bytes.
    pub fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size;
        if self.buffer.len() - self.read_pos > size {
            self.buffer.clear();
            self.read_pos = 0;
        }
    }

    /// Appends the `\n` frame delimiter to an encoded message.
    #[must_use]
    pub fn frame(message: &[u8]) -> Vec<u8> {
        let mut framed = Vec::with_capacity(message.len() + 1);
        framed.extend_from_slice(message);
        framed.push(b'\n');
        framed
    }

    /// Feeds bytes into the codec and returns every complete frame.
    ///
    /// Incomplete trailing data is buffered for the next call. Oversized
    /// messages clear the buffer and error.
    pub fn decode(&mut self, data: &[u8]) -> McpResult<Vec<Vec<u8>>> {
        let unread = self.buffer.len() - self.read_pos;
        if unread.saturating_add(data.len()) > self.max_message_size {
            let size = unread + data.len();
            self.buffer.clear();
            self.read_pos = 0;
            return Err(McpError::invalid_request(format!(
                "message too large: {size} bytes"
            )));
        }

        if self.read_pos >= COMPACT_THRESHOLD {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }

        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut start = self.read_pos;
        let mut pos = start;
        while pos < self.buffer.len() {
            if self.buffer[pos] == b'\n' {
                let frame = trim_cr(&self.buffer[start..pos]);
                if !frame.is_empty() {
                    frames.push(frame.to_vec());
                }
                start = pos + 1;
            }
            pos += 1;
        }
        self.read_pos = start;

        Ok(frames)
    }

    /// Discards buffered partial data.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

fn trim_cr(frame: &[u8]) -> &[u8] {
    match frame.last() {
        Some(b'\r') => &frame[..frame.len() - 1],
        _ => frame,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_appends_newline() {
        assert_eq!(Codec::frame(b"{}"), b"{}\n");
    }

    #[test]
    fn decode_single_frame() {
        let mut codec = Codec::new();
        let frames = codec.decode(b"{\"jsonrpc\":\"2.0\"}\n").unwrap();
        assert_eq!(frames, vec![b"{\"jsonrpc\":\"2.0\"}".to_vec()]);
    }

    #[test]
    fn decode_multiple_frames_in_one_chunk() {
        let mut codec = Codec::new();
        let frames = codec.decode(b"{\"a\":1}\n{\"b\":2}\n").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], b"{\"b\":2}");
    }

    #[test]
    fn decode_partial_then_rest() {
        let mut codec = Codec::new();
        assert!(codec.decode(b"{\"method\":\"pi").unwrap().is_empty());
        let frames = codec.decode(b"ng\"}\n").unwrap();
        assert_eq!(frames, vec![b"{\"method\":\"ping\"}".to_vec()]);
    }

    #[test]
    fn decode_skips_empty_lines_and_trims_cr() {
        let mut codec = Codec::new();
        let frames = codec.decode(b"\n{\"a\":1}\r\n\n").unwrap();
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec()]);
    }

    #[test]
    fn oversized_chunk_rejected_and_buffer_reset() {
        let mut codec = Codec::new();
        codec.set_max_message_size(8);
        assert!(codec.decode(b"0123456789").is_err());
        // The buffer was cleared; small frames work again.
        let frames = codec.decode(b"{\"a\":1}\n").unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn oversized_across_chunks_rejected() {
        let mut codec = Codec::new();
        codec.set_max_message_size(8);
        assert!(codec.decode(b"01234").is_ok());
        assert!(codec.decode(b"56789").is_err());
    }

    #[test]
    fn clear_discards_partial_data() {
        let mut codec = Codec::new();
        codec.decode(b"{\"partial").unwrap();
        codec.clear();
        let frames = codec.decode(b"{\"a\":1}\n").unwrap();
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec()]);
    }
}
