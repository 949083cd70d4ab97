use bytes::Bytes;

/// One server-sent event: an optional `event:` name plus the joined `data:` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser.
///
/// Feed arbitrary byte/str chunks as they arrive; completed events are returned
/// as soon as their terminating blank line is seen. Partial lines are buffered
/// across calls.
#[derive(Debug, Default)]
pub struct SseParser {
    /// Incomplete UTF-8 suffix carried over from the previous byte chunk.
    pending: Vec<u8>,
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Network chunks split anywhere, including inside a multi-byte UTF-8
    /// character; the undecodable tail is held back until the rest arrives.
    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    self.buffer
                        .push_str(std::str::from_utf8(&self.pending[..valid_up_to]).unwrap_or(""));
                    match err.error_len() {
                        // Truncated character at the chunk edge: keep it.
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                        // Genuinely invalid bytes: skip them and keep going.
                        Some(bad) => {
                            self.pending.drain(..valid_up_to + bad);
                        }
                    }
                }
            }
        }
        self.drain_lines()
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        self.drain_lines()
    }

    fn drain_lines(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.accept_line(line.trim_end_matches(['\n', '\r']), &mut events);
        }
        events
    }

    /// Flush any trailing, unterminated line and the event it belongs to.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.accept_line(line.trim_end_matches('\r'), &mut events);
        }
        self.complete_event(&mut events);
        events
    }

    fn accept_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.complete_event(events);
            return;
        }
        // Lines starting with ':' are comments per the SSE spec.
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "data" => self.data_lines.push(value.to_string()),
            // id/retry and unknown fields are irrelevant to the decoder.
            _ => {}
        }
    }

    fn complete_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event_with_name_and_data() {
        let mut parser = SseParser::new();
        let events = parser.push_str("event: patch\ndata: {\"x\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("patch"));
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn split_across_arbitrary_chunk_boundaries() {
        let mut parser = SseParser::new();
        let mut events = parser.push_str("data: hel");
        events.extend(parser.push_str("lo\nda"));
        events.extend(parser.push_str("ta: world\n\n"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello\nworld");
    }

    #[test]
    fn comments_and_unknown_fields_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.push_str(": keepalive\nid: 7\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: done\ndata: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("done"));
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn multibyte_char_split_across_chunks() {
        let payload = "data: héllo\n\n".as_bytes();
        // The é encodes as two bytes; split every way, including inside it.
        for split in 1..payload.len() {
            let mut parser = SseParser::new();
            let mut events = parser.push_bytes(&Bytes::copy_from_slice(&payload[..split]));
            events.extend(parser.push_bytes(&Bytes::copy_from_slice(&payload[split..])));
            assert_eq!(events.len(), 1, "split at {split}");
            assert_eq!(events[0].data, "héllo", "split at {split}");
        }
    }

    #[test]
    fn four_byte_char_fed_one_byte_at_a_time() {
        let mut parser = SseParser::new();
        let mut events = Vec::new();
        for byte in "data: 𝄞x\n\n".as_bytes() {
            events.extend(parser.push_bytes(&Bytes::copy_from_slice(&[*byte])));
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "𝄞x");
    }

    #[test]
    fn invalid_bytes_are_skipped_without_losing_the_line() {
        let mut parser = SseParser::new();
        let mut raw = b"data: a".to_vec();
        raw.push(0xFF);
        raw.extend_from_slice(b"b\n\n");
        let events = parser.push_bytes(&Bytes::from(raw));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ab");
    }

    #[test]
    fn crlf_lines_are_accepted() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: a\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a");
    }
}
