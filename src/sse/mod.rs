//! Server-Sent Events stream parser.
//!
//! Consumes a response body line by line as it streams through the engine,
//! builds typed [`Event`] records for persistence/broadcast, and leaves byte
//! forwarding to the caller (the parser never owns the writer side; see the
//! engine's tee loop). Grounded in the line-level extractor idioms used for
//! Anthropic SSE parsing, generalized to a provider-agnostic event/data
//! accumulator with the fixed caps below.

use crate::model::{Event, Priority};
use chrono::Utc;
use serde_json::Value;

pub const MAX_LINE_BYTES: usize = 1024 * 1024;
pub const MAX_EVENT_DATA_BYTES: usize = 2 * 1024 * 1024;
pub const MAX_EVENTS_PER_FLOW: u64 = 10_000;

/// Accumulates SSE lines into completed [`Event`] records, enforcing the
/// per-line, per-event, and per-flow caps. One parser per flow.
pub struct SseParser {
    flow_id: String,
    sequence: u64,
    events_emitted: u64,
    events_dropped: u32,
    pending_type: Option<String>,
    pending_data: String,
    pending_truncated: bool,
    aborted: bool,
}

/// Outcome of feeding one line to the parser.
pub enum Feed {
    /// No event completed yet; keep reading.
    Continue,
    /// An event completed and should be persisted/broadcast.
    Event(Event),
    /// The line exceeded [`MAX_LINE_BYTES`]; the caller must mark the flow
    /// `flow_integrity = corrupted` and stop parsing (bytes already
    /// forwarded to the client are left in place).
    LineTooLong,
    /// The per-flow event cap was hit; this and all further completed
    /// events are silently counted, not emitted. The caller should record a
    /// single drop_log entry the first time this is returned.
    EventCapped,
}

impl SseParser {
    pub fn new(flow_id: String) -> Self {
        Self {
            flow_id,
            sequence: 0,
            events_emitted: 0,
            events_dropped: 0,
            pending_type: None,
            pending_data: String::new(),
            pending_truncated: false,
            aborted: false,
        }
    }

    pub fn events_dropped_count(&self) -> u32 {
        self.events_dropped
    }

    /// Feed one line (without its trailing newline). `timestamp_mono_ns`
    /// should come from a monotonic clock sampled by the caller at receipt.
    pub fn feed_line(&mut self, line: &str, timestamp_mono_ns: i64) -> Feed {
        if self.aborted {
            return Feed::Continue;
        }
        if line.len() > MAX_LINE_BYTES {
            self.aborted = true;
            return Feed::LineTooLong;
        }

        if line.is_empty() {
            return self.finish_event(timestamp_mono_ns);
        }
        if line.starts_with(':') {
            return Feed::Continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.pending_type = Some(rest.trim().to_string());
            return Feed::Continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            if self.pending_data.len() + rest.len() > MAX_EVENT_DATA_BYTES {
                self.pending_truncated = true;
            } else {
                if !self.pending_data.is_empty() {
                    self.pending_data.push('\n');
                }
                self.pending_data.push_str(rest);
            }
            return Feed::Continue;
        }
        // Unrecognized field name per the SSE spec; ignored.
        Feed::Continue
    }

    /// Flush any event accumulated without a trailing blank line, as
    /// required when the stream ends mid-event.
    pub fn finish(&mut self, timestamp_mono_ns: i64) -> Feed {
        self.finish_event(timestamp_mono_ns)
    }

    fn finish_event(&mut self, timestamp_mono_ns: i64) -> Feed {
        if self.pending_type.is_none() && self.pending_data.is_empty() {
            return Feed::Continue;
        }
        let event_type = self.pending_type.take().unwrap_or_default();
        let mut data = std::mem::take(&mut self.pending_data);
        let truncated = std::mem::take(&mut self.pending_truncated);

        if self.events_emitted >= MAX_EVENTS_PER_FLOW {
            self.events_dropped += 1;
            return Feed::EventCapped;
        }

        let mut payload = parse_event_data(&data);
        if truncated {
            if let Value::Object(ref mut map) = payload {
                map.insert("_truncated".to_string(), Value::Bool(true));
            }
        }
        data.clear();

        self.sequence += 1;
        self.events_emitted += 1;

        Feed::Event(Event {
            flow_id: self.flow_id.clone(),
            sequence: self.sequence,
            priority: Priority::for_event_type(&event_type),
            event_type,
            event_data: payload,
            timestamp: Utc::now(),
            timestamp_mono_ns,
        })
    }
}

fn parse_event_data(data: &str) -> Value {
    serde_json::from_str(data).unwrap_or_else(|_| serde_json::json!({ "raw": data }))
}

/// `message_start.message.usage` plus `message_delta.usage.output_tokens`.
pub fn extract_usage(events: &[Event]) -> crate::model::Usage {
    let mut usage = crate::model::Usage::default();
    for event in events {
        match event.event_type.as_str() {
            "message_start" => {
                if let Some(u) = event.event_data.get("message").and_then(|m| m.get("usage")) {
                    usage.input_tokens = u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
                    usage.cache_creation_tokens =
                        u.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
                    usage.cache_read_tokens =
                        u.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32;
                }
            }
            "message_delta" => {
                if let Some(u) = event.event_data.get("usage") {
                    if let Some(out) = u.get("output_tokens").and_then(Value::as_u64) {
                        usage.output_tokens = out as u32;
                    }
                }
            }
            _ => {}
        }
    }
    usage
}

pub fn extract_model(events: &[Event]) -> Option<String> {
    events
        .iter()
        .find(|e| e.event_type == "message_start")
        .and_then(|e| e.event_data.get("message")?.get("model")?.as_str())
        .map(String::from)
}

#[derive(Debug, Clone, Default)]
pub struct ToolUse {
    pub index: u64,
    pub id: Option<String>,
    pub name: Option<String>,
    pub input: Value,
}

/// Reassembles streamed `tool_use` content blocks from `content_block_start`
/// / `content_block_delta` pairs, keyed by content block index.
pub fn extract_tool_uses(events: &[Event]) -> Vec<ToolUse> {
    let mut by_index: Vec<(u64, ToolUse, String)> = Vec::new();

    for event in events {
        match event.event_type.as_str() {
            "content_block_start" => {
                let Some(block) = event.event_data.get("content_block") else {
                    continue;
                };
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    continue;
                }
                let Some(index) = event.event_data.get("index").and_then(Value::as_u64) else {
                    continue;
                };
                by_index.push((
                    index,
                    ToolUse {
                        index,
                        id: block.get("id").and_then(Value::as_str).map(String::from),
                        name: block.get("name").and_then(Value::as_str).map(String::from),
                        input: Value::Null,
                    },
                    String::new(),
                ));
            }
            "content_block_delta" => {
                let Some(index) = event.event_data.get("index").and_then(Value::as_u64) else {
                    continue;
                };
                let Some(delta) = event.event_data.get("delta") else {
                    continue;
                };
                if delta.get("type").and_then(Value::as_str) != Some("input_json_delta") {
                    continue;
                }
                let Some(partial) = delta.get("partial_json").and_then(Value::as_str) else {
                    continue;
                };
                if let Some((_, _, buf)) = by_index.iter_mut().find(|(i, ..)| *i == index) {
                    buf.push_str(partial);
                }
            }
            _ => {}
        }
    }

    by_index
        .into_iter()
        .map(|(_, mut tool_use, buf)| {
            if !buf.is_empty() {
                tool_use.input = serde_json::from_str(&buf).unwrap_or(Value::Null);
            }
            tool_use
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut SseParser, lines: &[&str]) -> Vec<Event> {
        let mut out = Vec::new();
        for line in lines {
            if let Feed::Event(e) = parser.feed_line(line, 0) {
                out.push(e);
            }
        }
        if let Feed::Event(e) = parser.finish(0) {
            out.push(e);
        }
        out
    }

    #[test]
    fn parses_event_and_data_lines_into_one_event() {
        let mut parser = SseParser::new("flow-1".to_string());
        let events = feed_all(
            &mut parser,
            &["event: message_start", r#"data: {"type":"message_start","message":{"model":"claude-sonnet-4"}}"#, ""],
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "message_start");
        assert_eq!(events[0].priority, Priority::High);
        assert_eq!(events[0].sequence, 1);
    }

    #[test]
    fn emits_trailing_event_without_blank_line() {
        let mut parser = SseParser::new("flow-1".to_string());
        let events = feed_all(&mut parser, &["event: ping", "data: {}"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "ping");
    }

    #[test]
    fn multiple_data_lines_are_joined_with_newline() {
        let mut parser = SseParser::new("flow-1".to_string());
        let events = feed_all(&mut parser, &["event: custom", "data: line one", "data: line two", ""]);
        assert_eq!(events[0].event_data, serde_json::json!({"raw": "line one\nline two"}));
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut parser = SseParser::new("flow-1".to_string());
        let events = feed_all(&mut parser, &[": heartbeat", "event: ping", "data: {}", ""]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn unparseable_data_falls_back_to_raw() {
        let mut parser = SseParser::new("flow-1".to_string());
        let events = feed_all(&mut parser, &["event: weird", "data: not json", ""]);
        assert_eq!(events[0].event_data, serde_json::json!({ "raw": "not json" }));
    }

    #[test]
    fn line_exceeding_cap_aborts_parser() {
        let mut parser = SseParser::new("flow-1".to_string());
        let huge = "data: ".to_string() + &"x".repeat(MAX_LINE_BYTES + 1);
        match parser.feed_line(&huge, 0) {
            Feed::LineTooLong => {}
            _ => panic!("expected LineTooLong"),
        }
    }

    #[test]
    fn event_cap_counts_drops_after_limit() {
        let mut parser = SseParser::new("flow-1".to_string());
        for _ in 0..MAX_EVENTS_PER_FLOW {
            let _ = feed_all(&mut parser, &["event: ping", "data: {}", ""]);
        }
        match parser.feed_line("event: ping", 0) {
            Feed::Continue => {}
            _ => panic!(),
        }
        parser.feed_line("data: {}", 0);
        match parser.finish(0) {
            Feed::EventCapped => {}
            _ => panic!("expected EventCapped"),
        }
        assert_eq!(parser.events_dropped_count(), 1);
    }

    #[test]
    fn extract_usage_reads_start_and_delta() {
        let events = vec![
            Event {
                flow_id: "f".into(),
                sequence: 1,
                event_type: "message_start".into(),
                event_data: serde_json::json!({"message": {"usage": {"input_tokens": 10, "cache_read_input_tokens": 2}}}),
                priority: Priority::High,
                timestamp: Utc::now(),
                timestamp_mono_ns: 0,
            },
            Event {
                flow_id: "f".into(),
                sequence: 2,
                event_type: "message_delta".into(),
                event_data: serde_json::json!({"usage": {"output_tokens": 20}}),
                priority: Priority::High,
                timestamp: Utc::now(),
                timestamp_mono_ns: 0,
            },
        ];
        let usage = extract_usage(&events);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cache_read_tokens, 2);
    }

    #[test]
    fn extract_tool_uses_reassembles_streamed_input_json() {
        let events = vec![
            Event {
                flow_id: "f".into(),
                sequence: 1,
                event_type: "content_block_start".into(),
                event_data: serde_json::json!({"index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "grep"}}),
                priority: Priority::Medium,
                timestamp: Utc::now(),
                timestamp_mono_ns: 0,
            },
            Event {
                flow_id: "f".into(),
                sequence: 2,
                event_type: "content_block_delta".into(),
                event_data: serde_json::json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"pat"}}),
                priority: Priority::Low,
                timestamp: Utc::now(),
                timestamp_mono_ns: 0,
            },
            Event {
                flow_id: "f".into(),
                sequence: 3,
                event_type: "content_block_delta".into(),
                event_data: serde_json::json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "tern\":\"foo\"}"}}),
                priority: Priority::Low,
                timestamp: Utc::now(),
                timestamp_mono_ns: 0,
            },
        ];
        let tool_uses = extract_tool_uses(&events);
        assert_eq!(tool_uses.len(), 1);
        assert_eq!(tool_uses[0].name.as_deref(), Some("grep"));
        assert_eq!(tool_uses[0].input, serde_json::json!({"pattern": "foo"}));
    }
}
