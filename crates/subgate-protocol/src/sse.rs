use bytes::Bytes;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// The accumulated line buffer outgrew its cap; the stream must be torn
/// down rather than silently truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("sse line buffer exceeded {max} bytes")]
pub struct SseOverflow {
    pub max: usize,
}

/// Incremental SSE decoder tolerant of non-standard upstreams: `data:{...}`
/// without a space is accepted, as are bare `data`/`event` field lines.
#[derive(Debug)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
    max_buffer: usize,
}

impl SseParser {
    pub fn new(max_buffer: usize) -> Self {
        Self {
            buffer: String::new(),
            event: None,
            data_lines: Vec::new(),
            max_buffer,
        }
    }

    pub fn feed(&mut self, chunk: &Bytes) -> Result<Vec<SseEvent>, SseOverflow> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.feed_str(text),
            Err(_) => Ok(Vec::new()),
        }
    }

    pub fn feed_str(&mut self, chunk: &str) -> Result<Vec<SseEvent>, SseOverflow> {
        if self.buffer.len() + chunk.len() > self.max_buffer {
            return Err(SseOverflow {
                max: self.max_buffer,
            });
        }
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_line(&line, &mut events);
        }

        Ok(events)
    }

    /// Flush whatever is pending once the upstream closed without a final
    /// blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            let mut ignored = Vec::new();
            self.consume_line(&line, &mut ignored);
        }
        let mut events = Vec::new();
        self.flush_event(&mut events);
        events
    }

    fn consume_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.flush_event(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
            return;
        }
        if line == "event" {
            self.event = None;
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
            return;
        }
        if line == "data" {
            self.data_lines.push(String::new());
        }
    }

    fn flush_event(&mut self, events: &mut Vec<SseEvent>) {
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

/// Serialize an event back to the wire with `\n\n` block framing, so a flush
/// never splits an event in half.
pub fn encode_sse_event(event: &SseEvent) -> String {
    let mut out = String::new();
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

pub fn is_done_marker(data: &str) -> bool {
    data.trim() == "[DONE]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_across_chunks() {
        let mut parser = SseParser::new(1024);
        assert!(parser.feed_str("event: message_start\nda").unwrap().is_empty());
        let events = parser.feed_str("ta: {\"a\":1}\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn tolerates_data_without_space() {
        let mut parser = SseParser::new(1024);
        let events = parser.feed_str("data:{\"x\":2}\n\n").unwrap();
        assert_eq!(events[0].data, "{\"x\":2}");
    }

    #[test]
    fn joins_multiple_data_lines() {
        let mut parser = SseParser::new(1024);
        let events = parser.feed_str("data: a\ndata: b\n\n").unwrap();
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn overflow_is_reported_not_truncated() {
        let mut parser = SseParser::new(8);
        let err = parser.feed_str("data: 0123456789").unwrap_err();
        assert_eq!(err.max, 8);
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseParser::new(1024);
        assert!(parser.feed_str("data: tail").unwrap().is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn encode_keeps_block_framing() {
        let event = SseEvent {
            event: Some("message_stop".to_string()),
            data: "{}".to_string(),
        };
        assert_eq!(encode_sse_event(&event), "event: message_stop\ndata: {}\n\n");
    }

    #[test]
    fn done_marker_detection() {
        assert!(is_done_marker(" [DONE] "));
        assert!(!is_done_marker("{\"type\":\"ping\"}"));
    }
}
