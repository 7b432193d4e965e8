//! Tool-use correlation: turns streamed `tool_use` content blocks into
//! durable [`ToolInvocation`] rows, and later matches `tool_result` blocks
//! in subsequent requests back to the invocation they answer.

use crate::model::ToolInvocation;
use crate::util::truncate_utf8_safe;
use chrono::Utc;
use serde_json::Value;

const ERROR_MESSAGE_MAX_BYTES: usize = 2048;

/// Build one [`ToolInvocation`] per tool use extracted from a completed
/// flow's SSE events (response side of §4.7).
pub fn invocations_from_response(flow_id: &str, task_id: Option<String>, tool_uses: &[crate::sse::ToolUse]) -> Vec<ToolInvocation> {
    tool_uses
        .iter()
        .map(|tu| {
            let mut inv = ToolInvocation::new(flow_id.to_string(), task_id.clone(), tu.id.clone(), tu.name.clone().unwrap_or_default());
            inv.tool_type = Some("tool_use".to_string());
            inv
        })
        .collect()
}

/// One resolved `tool_result` block, ready to apply to its matching
/// invocation.
pub struct ToolResult {
    pub tool_use_id: String,
    pub is_error: bool,
    pub error_message: Option<String>,
}

/// Parse a request body for `tool_result` content blocks (request side of
/// §4.7). Tolerant: any shape mismatch yields an empty result rather than
/// an error, since the request may legitimately be unrelated to tool use.
pub fn extract_tool_results(body: &[u8]) -> Vec<ToolResult> {
    let Ok(json) = serde_json::from_slice::<Value>(body) else {
        return Vec::new();
    };
    let Some(messages) = json.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut results = Vec::new();
    for message in messages {
        let Some(content) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for block in content {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let Some(tool_use_id) = block.get("tool_use_id").and_then(Value::as_str) else {
                continue;
            };
            let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            let error_message = if is_error {
                block_content_as_text(block.get("content"))
                    .map(|s| truncate_utf8_safe(&s, ERROR_MESSAGE_MAX_BYTES).to_string())
            } else {
                None
            };
            results.push(ToolResult { tool_use_id: tool_use_id.to_string(), is_error, error_message });
        }
    }
    results
}

fn block_content_as_text(content: Option<&Value>) -> Option<String> {
    match content {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(items)) => {
            let joined: String = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            if joined.is_empty() { None } else { Some(joined) }
        }
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

/// Apply a resolved [`ToolResult`] to the matching invocation's mutable
/// fields, given the invocation's original timestamp for duration
/// computation. Returns the fields to persist via `update_tool_result`.
pub fn apply_result(result: &ToolResult, invocation_timestamp: chrono::DateTime<Utc>) -> (bool, i64, Option<String>) {
    let success = !result.is_error;
    let duration_ms = (Utc::now() - invocation_timestamp).num_milliseconds();
    (success, duration_ms, result.error_message.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tool_result_with_string_content() {
        let body = br#"{
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "is_error": false, "content": "ok"}
                ]}
            ]
        }"#;
        let results = extract_tool_results(body);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_use_id, "toolu_1");
        assert!(!results[0].is_error);
    }

    #[test]
    fn captures_error_message_on_failed_tool_result() {
        let body = br#"{
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_2", "is_error": true, "content": "file not found"}
                ]}
            ]
        }"#;
        let results = extract_tool_results(body);
        assert!(results[0].is_error);
        assert_eq!(results[0].error_message.as_deref(), Some("file not found"));
    }

    #[test]
    fn non_json_body_yields_no_results_without_erroring() {
        let body = b"not json at all";
        assert!(extract_tool_results(body).is_empty());
    }

    #[test]
    fn missing_tool_use_id_is_skipped() {
        let body = br#"{"messages": [{"content": [{"type": "tool_result", "is_error": false}]}]}"#;
        assert!(extract_tool_results(body).is_empty());
    }

    #[test]
    fn non_array_messages_yields_no_results() {
        let body = br#"{"messages": "not an array"}"#;
        assert!(extract_tool_results(body).is_empty());
    }
}
