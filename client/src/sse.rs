//! Minimal incremental SSE parser.
//!
//! Feeds on raw body chunks and yields complete events. Only the framing the
//! gateway emits is supported: `id:` lines, `data:` lines (multiple join
//! with a newline) and `:` comment lines, frames separated by a blank line.

/// One parsed SSE event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    /// The `id:` line, when present.
    pub id: Option<String>,
    /// Joined `data:` payload.
    pub data: String,
}

/// Incremental parser over chunked SSE bodies.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        // Frames end at a blank line; keep the trailing partial frame.
        while let Some(boundary) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..boundary + 2).collect();
            if let Some(event) = parse_frame(&frame) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut id = None;
    let mut data_lines = Vec::new();

    for line in frame.lines() {
        if line.starts_with(':') {
            // Heartbeat comment.
            continue;
        }
        if let Some(value) = line.strip_prefix("id:") {
            id = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        id,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_frame() {
        let mut parser = SseParser::new();
        let events = parser.push("id: 42\ndata: {\"event\":\"token\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("42"));
        assert_eq!(events[0].data, "{\"event\":\"token\"}");
    }

    #[test]
    fn reassembles_frames_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push("id: 1\nda").is_empty());
        let events = parser.push("ta: hello\n\nid: 2\ndata: world\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[1].id.as_deref(), Some("2"));
    }

    #[test]
    fn comments_are_ignored() {
        let mut parser = SseParser::new();
        assert!(parser.push(": keepalive\n\n").is_empty());
        let events = parser.push(": keepalive\nid: 7\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn multiple_data_lines_join_with_newlines() {
        let mut parser = SseParser::new();
        let events = parser.push("data: a\ndata: b\n\n");
        assert_eq!(events[0].data, "a\nb");
    }
}
