//! Newline-delimited JSON stream parsing.
//!
//! The assistant CLI writes one JSON record per line to stdout. Output arrives
//! in arbitrary chunks, so [`StreamParser`] buffers the trailing partial line
//! until its newline shows up.

use serde_json::Value;

/// A single parsed record from the assistant's output stream.
///
/// The wire format belongs to the assistant, so the record is kept opaque and
/// only the fields the engine cares about are exposed.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    raw: Value,
}

impl StreamEvent {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// The underlying JSON record.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Top-level `type` tag.
    pub fn event_type(&self) -> Option<&str> {
        self.raw.get("type").and_then(Value::as_str)
    }

    /// Top-level `subtype` tag.
    pub fn subtype(&self) -> Option<&str> {
        self.raw.get("subtype").and_then(Value::as_str)
    }

    /// The partial-message payload: `event` for wrapped records, else the record itself.
    fn inner(&self) -> &Value {
        if self.event_type() == Some("stream_event") {
            self.raw.get("event").unwrap_or(&self.raw)
        } else {
            &self.raw
        }
    }

    fn inner_type(&self) -> Option<&str> {
        self.inner().get("type").and_then(Value::as_str)
    }

    /// Incremental text fragment, if this is a text delta.
    pub fn text_delta(&self) -> Option<&str> {
        if self.inner_type() != Some("content_block_delta") {
            return None;
        }
        let delta = self.inner().get("delta")?;
        match delta.get("type").and_then(Value::as_str) {
            Some("text_delta") | None => delta.get("text").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Content block index for partial-message records.
    pub fn block_index(&self) -> Option<u64> {
        self.inner().get("index").and_then(Value::as_u64)
    }

    /// Tool name if this record opens a tool-use block.
    pub fn tool_start(&self) -> Option<&str> {
        if self.inner_type() != Some("content_block_start") {
            return None;
        }
        let block = self.inner().get("content_block")?;
        if block.get("type").and_then(Value::as_str) == Some("tool_use") {
            block.get("name").and_then(Value::as_str)
        } else {
            None
        }
    }

    /// Whether this record closes a content block.
    pub fn is_block_stop(&self) -> bool {
        self.inner_type() == Some("content_block_stop")
    }

    fn message_content(&self) -> Option<&Vec<Value>> {
        if self.event_type() != Some("assistant") {
            return None;
        }
        self.raw
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
    }

    /// Concatenated text of a complete (non-streamed) assistant message.
    pub fn full_text(&self) -> Option<String> {
        let content = self.message_content()?;
        let text: String = content
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Tool names invoked by a complete assistant message.
    pub fn message_tools(&self) -> Vec<&str> {
        self.message_content()
            .map(|content| {
                content
                    .iter()
                    .filter(|item| item.get("type").and_then(Value::as_str) == Some("tool_use"))
                    .filter_map(|item| item.get("name").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether this is the final result record.
    pub fn is_result(&self) -> bool {
        self.event_type() == Some("result")
    }

    /// Whether the result record reports an error.
    pub fn is_error(&self) -> bool {
        self.raw
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
            || self.subtype().is_some_and(|s| s.starts_with("error"))
    }

    /// Total cost reported by the result record.
    pub fn cost_usd(&self) -> Option<f64> {
        self.raw
            .get("total_cost_usd")
            .or_else(|| self.raw.get("cost_usd"))
            .and_then(Value::as_f64)
    }

    /// Duration reported by the result record.
    pub fn duration_ms(&self) -> Option<u64> {
        self.raw.get("duration_ms").and_then(Value::as_u64)
    }

    /// Final answer text carried by the result record.
    pub fn result_text(&self) -> Option<&str> {
        if !self.is_result() {
            return None;
        }
        self.raw.get("result").and_then(Value::as_str)
    }
}

/// Incremental parser for newline-delimited JSON.
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every record completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(parse_line)
            .collect()
    }

    /// Parses whatever remains as one final record and clears the buffer.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        let remaining = std::mem::take(&mut self.buffer);
        parse_line(&remaining).into_iter().collect()
    }

    /// Bytes currently held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_line(line: &[u8]) -> Option<StreamEvent> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Some(StreamEvent::new(value)),
        Err(e) => {
            tracing::trace!(error = %e, line = %trimmed, "dropping malformed stream line");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELTA: &str = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"héllo"}}}"#;

    #[test]
    fn parses_complete_lines_and_keeps_partial() {
        let mut parser = StreamParser::new();
        let input = format!("{}\n{{\"type\":\"res", DELTA);

        let events = parser.feed(input.as_bytes());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text_delta(), Some("héllo"));
        assert!(parser.pending() > 0);

        let events = parser.feed(b"ult\",\"total_cost_usd\":0.5}\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_result());
        assert_eq!(events[0].cost_usd(), Some(0.5));
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn split_at_any_offset_matches_whole() {
        let line = format!("{}\n", DELTA);
        let bytes = line.as_bytes();

        let mut whole = StreamParser::new();
        let expected = whole.feed(bytes);

        for split in 0..bytes.len() {
            let mut parser = StreamParser::new();
            let mut events = parser.feed(&bytes[..split]);
            events.extend(parser.feed(&bytes[split..]));
            assert_eq!(events, expected, "split at {}", split);
        }
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let mut parser = StreamParser::new();
        let input = format!("not json\n{{broken\n\n{}\n", DELTA);

        let events = parser.feed(input.as_bytes());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text_delta(), Some("héllo"));
    }

    #[test]
    fn flush_parses_trailing_record_and_clears() {
        let mut parser = StreamParser::new();
        assert!(parser.feed(br#"{"type":"result","duration_ms":42}"#).is_empty());

        let events = parser.flush();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration_ms(), Some(42));
        assert_eq!(parser.pending(), 0);
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn flush_discards_garbage() {
        let mut parser = StreamParser::new();
        parser.feed(b"{\"half\":");
        assert!(parser.flush().is_empty());
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn detects_tool_blocks_and_messages() {
        let start = StreamEvent::new(serde_json::json!({
            "type": "stream_event",
            "event": {"type": "content_block_start", "index": 2,
                      "content_block": {"type": "tool_use", "name": "Bash"}}
        }));
        assert_eq!(start.tool_start(), Some("Bash"));
        assert_eq!(start.block_index(), Some(2));

        let message = StreamEvent::new(serde_json::json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Done. "},
                {"type": "tool_use", "name": "Edit", "input": {}},
                {"type": "text", "text": "Bye"}
            ]}
        }));
        assert_eq!(message.full_text().as_deref(), Some("Done. Bye"));
        assert_eq!(message.message_tools(), vec!["Edit"]);
    }

    #[test]
    fn result_error_flags() {
        let ok = StreamEvent::new(serde_json::json!({"type":"result","subtype":"success","is_error":false}));
        let failed = StreamEvent::new(serde_json::json!({"type":"result","subtype":"error_max_turns"}));
        assert!(!ok.is_error());
        assert!(failed.is_error());
    }
}
