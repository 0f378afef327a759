//! Server-sent-event line parsing shared by the OpenAI-shaped and Anthropic
//! stream readers.

/// One decoded SSE event: an optional `event:` label and its `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if the vendor sends labeled events.
    pub event: Option<String>,
    /// Concatenated `data:` payload for this event.
    pub data: String,
}

/// Incrementally parses a byte stream into [`SseEvent`]s, buffering across
/// chunk boundaries. Blank lines terminate one event; non-`data`/`event`
/// lines are ignored per the wire contract.
pub struct SseDecoder {
    buf: String,
    pending_event: Option<String>,
    pending_data: Vec<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    /// Construct an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            pending_event: None,
            pending_data: Vec::new(),
        }
    }

    /// Feed raw bytes in, returning any complete events flushed by this chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();

        while let Some(idx) = self.buf.find('\n') {
            let line = self.buf[..idx].trim_end_matches('\r').to_owned();
            self.buf.drain(..=idx);

            if line.is_empty() {
                if !self.pending_data.is_empty() {
                    out.push(SseEvent {
                        event: self.pending_event.take(),
                        data: self.pending_data.join("\n"),
                    });
                    self.pending_data.clear();
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("data:") {
                self.pending_data.push(rest.trim_start().to_owned());
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.pending_event = Some(rest.trim_start().to_owned());
            }
            // any other field (id:, retry:, comments) is ignored.
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_splits_on_blank_line() {
        let mut d = SseDecoder::new();
        let events = d.feed(b"data: {\"a\":1}\n\ndata: {\"a\":2}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert_eq!(events[1].data, r#"{"a":2}"#);
    }

    #[test]
    fn decoder_handles_labeled_events() {
        let mut d = SseDecoder::new();
        let events = d.feed(b"event: message_start\ndata: {\"id\":\"x\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
    }

    #[test]
    fn decoder_buffers_across_feeds() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"data: partial").is_empty());
        let events = d.feed(b"-line\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "partial-line");
    }

    #[test]
    fn decoder_ignores_unknown_fields() {
        let mut d = SseDecoder::new();
        let events = d.feed(b"id: 5\nretry: 100\ndata: hi\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hi");
    }
}
