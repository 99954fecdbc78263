//! Incremental server-sent-events decoding for the HTTP client transports.

/// One decoded SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, when present.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
    /// `id:` field, when present.
    pub id: Option<String>,
}

/// Incremental SSE decoder: feed byte chunks, get completed events.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl EventStreamDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.flush() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                self.event = Some(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.trim_start().to_string());
            } else if let Some(rest) = line.strip_prefix("id:") {
                self.id = Some(rest.trim_start().to_string());
            }
        }
        events
    }

    /// Completes any pending event, for end-of-stream handling.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.flush()
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            self.id = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_event() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(b"event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
    }

    #[test]
    fn joins_multiline_data() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(b"data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn handles_chunk_boundaries_mid_line() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.push(b"data: par").is_empty());
        assert!(decoder.push(b"tial\n").is_empty());
        let events = decoder.push(b"\n");
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn tracks_event_ids_and_ignores_comments() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(b": keepalive\nid: 7\ndata: x\n\n");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.push(b"data: tail\n").is_empty());
        let event = decoder.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn endpoint_event_shape() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.push(b"event: endpoint\ndata: /message?sessionId=abc\n\n");
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/message?sessionId=abc");
    }
}
