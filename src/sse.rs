//! Byte-level SSE framing shared by the streaming parsers.

use bytes::BytesMut;

/// One complete SSE event: the optional `event:` tag and the joined
/// `data:` payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE framer. Feed raw body chunks, drain complete events.
/// Unterminated trailing data stays buffered until the next chunk or
/// `finish`.
#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: BytesMut,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        loop {
            let Some((pos, delimiter_len)) = find_event_delimiter(self.buffer.as_ref()) else {
                break;
            };
            let event_bytes = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);
            if let Some(event) = parse_event(event_bytes.as_ref()) {
                events.push(event);
            }
        }
        events
    }

    /// Upstream EOF: a trailing unterminated event still counts.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let event_bytes = self.buffer.split_off(0);
        parse_event(event_bytes.as_ref())
    }
}

/// Earliest blank-line boundary, whichever newline style arrives first.
fn find_event_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len()
            && buf[idx] == b'\r'
            && buf[idx + 1] == b'\n'
            && buf[idx + 2] == b'\r'
            && buf[idx + 3] == b'\n'
        {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

fn parse_event(event: &[u8]) -> Option<SseEvent> {
    let mut name: Option<String> = None;
    let mut data = String::new();
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };
        if let Some(rest) = line.strip_prefix("event:") {
            name = Some(rest.trim().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest);
        }
    }
    if name.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent { event: name, data })
}

/// Serialize an event for the client-facing stream.
pub fn encode_event(event: Option<&str>, data: &str) -> String {
    match event {
        Some(name) => format!("event: {name}\ndata: {data}\n\n"),
        None => format!("data: {data}\n\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_events_across_chunk_boundaries() {
        let mut framer = SseFramer::new();
        let first = framer.feed(b"data: {\"a\":");
        assert!(first.is_empty());
        let second = framer.feed(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].data, "{\"a\":1}");
        assert_eq!(second[1].data, "[DONE]");
        assert_eq!(framer.buffered_len(), 0);
    }

    #[test]
    fn joins_multiline_data_and_reads_event_tags() {
        let mut framer = SseFramer::new();
        let events =
            framer.feed(b"event: message_start\ndata: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn handles_crlf_delimiters() {
        let mut framer = SseFramer::new();
        let events = framer.feed(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "one");
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn finish_flushes_unterminated_trailer() {
        let mut framer = SseFramer::new();
        assert!(framer.feed(b"data: tail").is_empty());
        let event = framer.finish().expect("trailing event");
        assert_eq!(event.data, "tail");
        assert!(framer.finish().is_none());
    }

    #[test]
    fn comment_only_events_are_dropped() {
        let mut framer = SseFramer::new();
        let events = framer.feed(b": keepalive\n\ndata: real\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn encode_matches_wire_shape() {
        assert_eq!(encode_event(None, "{}"), "data: {}\n\n");
        assert_eq!(
            encode_event(Some("error"), "{\"error\":{}}"),
            "event: error\ndata: {\"error\":{}}\n\n"
        );
    }
}
