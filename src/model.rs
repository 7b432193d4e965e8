//! Core data model: the entities the durable store persists and the engine
//! passes between components. See the data model section of the design
//! docs for field-level invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,

    pub host: String,
    pub method: String,
    pub path: String,
    pub url: String,
    pub request_headers: HashMap<String, Vec<String>>,
    pub request_body: Option<String>,
    pub request_body_truncated: bool,

    pub status_code: Option<u16>,
    pub status_text: Option<String>,
    pub response_headers: Option<HashMap<String, Vec<String>>>,
    pub response_body: Option<String>,
    pub response_body_truncated: bool,
    pub is_sse: bool,
    pub duration_ms: Option<i64>,

    pub timestamp: DateTime<Utc>,
    pub timestamp_mono_ns: i64,

    pub provider: Provider,
    pub task_id: Option<String>,
    pub task_source: Option<TaskSource>,
    pub model: Option<String>,

    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub cache_creation_tokens: Option<u32>,
    pub cache_read_tokens: Option<u32>,
    pub total_cost: Option<f64>,
    pub cost_source: Option<CostSource>,

    pub flow_integrity: FlowIntegrity,
    pub events_dropped_count: u32,

    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Flow {
    /// Construct a new, in-flight flow record. `timestamp_mono_ns` should be
    /// derived from a monotonic clock (e.g. `Instant`) by the caller since
    /// that clock has no meaningful epoch of its own.
    pub fn new(host: String, method: String, path: String, url: String, timestamp_mono_ns: i64) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            host,
            method,
            path,
            url,
            request_headers: HashMap::new(),
            request_body: None,
            request_body_truncated: false,
            status_code: None,
            status_text: None,
            response_headers: None,
            response_body: None,
            response_body_truncated: false,
            is_sse: false,
            duration_ms: None,
            timestamp: now,
            timestamp_mono_ns,
            provider: Provider::Other,
            task_id: None,
            task_source: None,
            model: None,
            input_tokens: None,
            output_tokens: None,
            cache_creation_tokens: None,
            cache_read_tokens: None,
            total_cost: None,
            cost_source: None,
            flow_integrity: FlowIntegrity::Complete,
            events_dropped_count: 0,
            created_at: now,
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    Openai,
    Bedrock,
    Gemini,
    Other,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Openai => "openai",
            Provider::Bedrock => "bedrock",
            Provider::Gemini => "gemini",
            Provider::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "anthropic" => Provider::Anthropic,
            "openai" => Provider::Openai,
            "bedrock" => Provider::Bedrock,
            "gemini" => Provider::Gemini,
            _ => Provider::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    Explicit,
    Metadata,
    Inferred,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Explicit => "explicit",
            TaskSource::Metadata => "metadata",
            TaskSource::Inferred => "inferred",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostSource {
    Exact,
    Estimated,
}

impl CostSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostSource::Exact => "exact",
            CostSource::Estimated => "estimated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowIntegrity {
    Complete,
    Partial,
    Corrupted,
    Interrupted,
}

impl FlowIntegrity {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowIntegrity::Complete => "complete",
            FlowIntegrity::Partial => "partial",
            FlowIntegrity::Corrupted => "corrupted",
            FlowIntegrity::Interrupted => "interrupted",
        }
    }
}

/// One SSE event belonging to a flow. `(flow_id, sequence)` is unique;
/// never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub flow_id: String,
    pub sequence: u64,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    pub timestamp_mono_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    /// Fixed event_type -> priority mapping.
    pub fn for_event_type(event_type: &str) -> Self {
        match event_type {
            "message_start" | "message_stop" | "message_delta" | "error" => Priority::High,
            "content_block_start" | "content_block_stop" | "ping" => Priority::Medium,
            "content_block_delta" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

/// One tool call, correlated across the flow that issued it (response side)
/// and the later flow whose request carries the matching `tool_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub flow_id: String,
    pub task_id: Option<String>,
    pub tool_use_id: Option<String>,
    pub tool_name: String,
    pub tool_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub cost: Option<f64>,
}

impl ToolInvocation {
    pub fn new(flow_id: String, task_id: Option<String>, tool_use_id: Option<String>, tool_name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id,
            task_id,
            tool_use_id,
            tool_name,
            tool_type: None,
            timestamp: Utc::now(),
            duration_ms: None,
            success: None,
            error_message: None,
            cost: None,
        }
    }
}

/// Append-only record of events/messages dropped under a cap or
/// backpressure condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropLogEntry {
    pub flow_id: Option<String>,
    pub event_type: Option<String>,
    pub priority: Option<Priority>,
    pub reason: DropReason,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    QueueFull,
    EventCap,
    SizeCap,
    SubscriberSlow,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue_full",
            DropReason::EventCap => "event_cap",
            DropReason::SizeCap => "size_cap",
            DropReason::SubscriberSlow => "subscriber_slow",
        }
    }
}

/// Token usage extracted from a response, before cost computation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_creation_tokens: u32,
    pub cache_read_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mapping_matches_fixed_table() {
        assert_eq!(Priority::for_event_type("message_start"), Priority::High);
        assert_eq!(Priority::for_event_type("message_stop"), Priority::High);
        assert_eq!(Priority::for_event_type("message_delta"), Priority::High);
        assert_eq!(Priority::for_event_type("error"), Priority::High);
        assert_eq!(Priority::for_event_type("content_block_start"), Priority::Medium);
        assert_eq!(Priority::for_event_type("content_block_stop"), Priority::Medium);
        assert_eq!(Priority::for_event_type("ping"), Priority::Medium);
        assert_eq!(Priority::for_event_type("content_block_delta"), Priority::Low);
        assert_eq!(Priority::for_event_type("some_future_event"), Priority::Medium);
    }

    #[test]
    fn provider_round_trips_through_str() {
        for p in [Provider::Anthropic, Provider::Openai, Provider::Bedrock, Provider::Gemini, Provider::Other] {
            assert_eq!(Provider::parse(p.as_str()), p);
        }
    }
}
