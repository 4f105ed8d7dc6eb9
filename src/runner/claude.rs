//! Claude Code CLI stream-json interpretation.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::stream::StreamEvent;

use super::AgentEvent;

/// Builds the argument list for headless Claude Code with streamed JSON output.
///
/// The instruction string is appended after these arguments by the executor.
pub fn claude_args(model: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(), // Non-interactive mode
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(), // Required for stream-json
        "--include-partial-messages".to_string(),
        "--dangerously-skip-permissions".to_string(),
    ];

    if let Some(model) = model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }

    args.push("-p".to_string());
    args
}

/// Turns raw stream records into [`AgentEvent`]s and accumulates the
/// invocation's output.
///
/// Once a streaming text delta has been seen, complete assistant messages are
/// ignored for the rest of the invocation so text is not counted twice.
#[derive(Debug, Default)]
pub struct StreamInterpreter {
    text: String,
    saw_delta: bool,
    open_blocks: HashMap<u64, String>,
    pending_tools: VecDeque<String>,
    cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    result_text: Option<String>,
    result_error: bool,
}

impl StreamInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interprets one record.
    pub fn interpret(&mut self, event: &StreamEvent) -> Vec<AgentEvent> {
        let mut out = Vec::new();

        if let Some(delta) = event.text_delta() {
            self.saw_delta = true;
            if !delta.is_empty() {
                self.text.push_str(delta);
                out.push(AgentEvent::Text {
                    text: delta.to_string(),
                });
            }
            return out;
        }

        if let Some(name) = event.tool_start() {
            if let Some(index) = event.block_index() {
                self.open_blocks.insert(index, name.to_string());
            }
            self.saw_delta = true;
            out.push(AgentEvent::ToolStart {
                name: name.to_string(),
            });
            return out;
        }

        if event.is_block_stop() {
            if let Some(name) = event.block_index().and_then(|i| self.open_blocks.remove(&i)) {
                out.push(AgentEvent::ToolEnd { name });
            }
            return out;
        }

        match event.event_type() {
            Some("assistant") if !self.saw_delta => {
                if let Some(text) = event.full_text() {
                    if !self.text.is_empty() && !self.text.ends_with('\n') {
                        self.text.push('\n');
                    }
                    self.text.push_str(&text);
                    out.push(AgentEvent::Text { text });
                }
                for name in event.message_tools() {
                    self.pending_tools.push_back(name.to_string());
                    out.push(AgentEvent::ToolStart {
                        name: name.to_string(),
                    });
                }
            }
            Some("user") if !self.saw_delta => {
                for _ in 0..count_tool_results(event.raw()) {
                    if let Some(name) = self.pending_tools.pop_front() {
                        out.push(AgentEvent::ToolEnd { name });
                    }
                }
            }
            Some("result") => {
                self.cost_usd = event.cost_usd().or(self.cost_usd);
                self.duration_ms = event.duration_ms().or(self.duration_ms);
                self.result_text = event.result_text().map(str::to_string);
                self.result_error = event.is_error();
            }
            _ => {}
        }

        out
    }

    /// Accumulated text, falling back to the result record's text.
    pub fn output(&self) -> String {
        if self.text.is_empty() {
            self.result_text.clone().unwrap_or_default()
        } else {
            self.text.clone()
        }
    }

    pub fn cost_usd(&self) -> Option<f64> {
        self.cost_usd
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    /// Whether the result record reported an error.
    pub fn result_error(&self) -> bool {
        self.result_error
    }
}

fn count_tool_results(raw: &Value) -> usize {
    raw.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("tool_result"))
                .count()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(value: Value) -> StreamEvent {
        StreamEvent::new(value)
    }

    fn delta(text: &str) -> StreamEvent {
        ev(json!({"type": "stream_event", "event": {
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": text}}}))
    }

    fn full_message(text: &str) -> StreamEvent {
        ev(json!({"type": "assistant", "message": {"content": [{"type": "text", "text": text}]}}))
    }

    #[test]
    fn claude_args_include_stream_json_and_model() {
        let args = claude_args(Some("sonnet"));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"sonnet".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-p"));
    }

    #[test]
    fn deltas_suppress_full_message_fallback() {
        let mut interpreter = StreamInterpreter::new();
        interpreter.interpret(&delta("Hel"));
        interpreter.interpret(&delta("lo"));
        let events = interpreter.interpret(&full_message("Hello"));

        assert!(events.is_empty());
        assert_eq!(interpreter.output(), "Hello");
    }

    #[test]
    fn full_messages_used_without_deltas() {
        let mut interpreter = StreamInterpreter::new();
        let events = interpreter.interpret(&full_message("first"));
        interpreter.interpret(&full_message("second"));

        assert_eq!(events, vec![AgentEvent::Text { text: "first".into() }]);
        assert_eq!(interpreter.output(), "first\nsecond");
    }

    #[test]
    fn tool_blocks_emit_start_and_end() {
        let mut interpreter = StreamInterpreter::new();
        let start = interpreter.interpret(&ev(json!({"type": "stream_event", "event": {
            "type": "content_block_start", "index": 1,
            "content_block": {"type": "tool_use", "name": "Read"}}})));
        let text_stop = interpreter.interpret(&ev(json!({"type": "stream_event", "event": {
            "type": "content_block_stop", "index": 0}})));
        let stop = interpreter.interpret(&ev(json!({"type": "stream_event", "event": {
            "type": "content_block_stop", "index": 1}})));

        assert_eq!(start, vec![AgentEvent::ToolStart { name: "Read".into() }]);
        assert!(text_stop.is_empty());
        assert_eq!(stop, vec![AgentEvent::ToolEnd { name: "Read".into() }]);
    }

    #[test]
    fn non_streaming_tools_end_on_tool_result() {
        let mut interpreter = StreamInterpreter::new();
        interpreter.interpret(&ev(json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "name": "Bash", "input": {"command": "ls"}}]}})));
        let events = interpreter.interpret(&ev(json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "content": "ok"}]}})));

        assert_eq!(events, vec![AgentEvent::ToolEnd { name: "Bash".into() }]);
    }

    #[test]
    fn result_record_supplies_cost_and_fallback_text() {
        let mut interpreter = StreamInterpreter::new();
        interpreter.interpret(&ev(json!({
            "type": "result", "subtype": "success", "is_error": false,
            "total_cost_usd": 0.25, "duration_ms": 1500, "result": "all done"
        })));

        assert_eq!(interpreter.cost_usd(), Some(0.25));
        assert_eq!(interpreter.duration_ms(), Some(1500));
        assert_eq!(interpreter.output(), "all done");
        assert!(!interpreter.result_error());
    }
}
