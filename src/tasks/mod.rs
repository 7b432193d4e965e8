//! Task assignment: attribute a flow to a logical task/session id via an
//! explicit header, request metadata, or recency-based inference.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::TaskSource;

const EXPLICIT_HEADER: &str = "x-langley-task";

pub const DEFAULT_METADATA_FIELDS: &[&str] = &["metadata.user_id", "user", "metadata.userId"];

/// Tracks, per host, the most recently assigned task id, so back-to-back
/// requests from the same client within `idle_gap` reuse one task.
pub struct TaskRecencyMap {
    inner: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl TaskRecencyMap {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    fn lookup(&self, host: &str, idle_gap: chrono::Duration, now: DateTime<Utc>) -> Option<String> {
        let map = self.inner.lock().expect("task recency map mutex poisoned");
        map.get(host).and_then(|(task_id, seen_at)| {
            if now.signed_duration_since(*seen_at) <= idle_gap {
                Some(task_id.clone())
            } else {
                None
            }
        })
    }

    fn record(&self, host: &str, task_id: &str, now: DateTime<Utc>) {
        let mut map = self.inner.lock().expect("task recency map mutex poisoned");
        map.insert(host.to_string(), (task_id.to_string(), now));
    }
}

impl Default for TaskRecencyMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Assign `(task_id, source)` for an inbound request. `metadata_fields` is
/// the configured, ordered list of dotted JSON paths checked for the
/// metadata layer (`task.metadata_fields` in config; defaults to
/// [`DEFAULT_METADATA_FIELDS`]).
pub fn assign(
    recency: &TaskRecencyMap,
    host: &str,
    request_headers: &HashMap<String, Vec<String>>,
    request_body: Option<&[u8]>,
    metadata_fields: &[String],
    idle_gap_minutes: i64,
) -> (String, TaskSource) {
    let now = Utc::now();

    if let Some(values) = request_headers.get(EXPLICIT_HEADER) {
        if let Some(value) = values.first().filter(|v| !v.is_empty()) {
            recency.record(host, value, now);
            return (value.clone(), TaskSource::Explicit);
        }
    }

    if let Some(body) = request_body {
        if let Ok(json) = serde_json::from_slice::<Value>(body) {
            for field in metadata_fields {
                if let Some(value) = lookup_dotted(&json, field) {
                    recency.record(host, &value, now);
                    return (value, TaskSource::Metadata);
                }
            }
        }
    }

    let idle_gap = chrono::Duration::minutes(idle_gap_minutes);
    if let Some(task_id) = recency.lookup(host, idle_gap, now) {
        recency.record(host, &task_id, now);
        return (task_id, TaskSource::Inferred);
    }

    let task_id = format!("inferred-{}", uuid::Uuid::new_v4());
    recency.record(host, &task_id, now);
    (task_id, TaskSource::Inferred)
}

fn lookup_dotted(json: &Value, path: &str) -> Option<String> {
    let mut cur = json;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    cur.as_str().filter(|s| !s.is_empty()).map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<String> {
        DEFAULT_METADATA_FIELDS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn explicit_header_wins_over_everything() {
        let recency = TaskRecencyMap::new();
        let mut headers = HashMap::new();
        headers.insert(EXPLICIT_HEADER.to_string(), vec!["task-abc".to_string()]);
        let body = br#"{"metadata": {"user_id": "ignored"}}"#;
        let (task_id, source) = assign(&recency, "api.anthropic.com", &headers, Some(body), &fields(), 5);
        assert_eq!(task_id, "task-abc");
        assert_eq!(source, TaskSource::Explicit);
    }

    #[test]
    fn metadata_field_used_when_no_explicit_header() {
        let recency = TaskRecencyMap::new();
        let headers = HashMap::new();
        let body = br#"{"metadata": {"user_id": "user-42"}}"#;
        let (task_id, source) = assign(&recency, "api.anthropic.com", &headers, Some(body), &fields(), 5);
        assert_eq!(task_id, "user-42");
        assert_eq!(source, TaskSource::Metadata);
    }

    #[test]
    fn openai_top_level_user_field_is_checked_second() {
        let recency = TaskRecencyMap::new();
        let headers = HashMap::new();
        let body = br#"{"user": "user-99"}"#;
        let (task_id, source) = assign(&recency, "api.openai.com", &headers, Some(body), &fields(), 5);
        assert_eq!(task_id, "user-99");
        assert_eq!(source, TaskSource::Metadata);
    }

    #[test]
    fn inference_reuses_recent_task_for_same_host() {
        let recency = TaskRecencyMap::new();
        let headers = HashMap::new();
        let (first, source) = assign(&recency, "api.anthropic.com", &headers, None, &fields(), 5);
        assert_eq!(source, TaskSource::Inferred);
        let (second, source2) = assign(&recency, "api.anthropic.com", &headers, None, &fields(), 5);
        assert_eq!(source2, TaskSource::Inferred);
        assert_eq!(first, second, "requests within the idle gap should share a task id");
    }

    #[test]
    fn inferred_ids_are_prefixed_and_stable_across_repeated_calls() {
        let recency = TaskRecencyMap::new();
        let headers = HashMap::new();
        let (task_id, _) = assign(&recency, "api.anthropic.com", &headers, None, &fields(), 5);
        assert!(task_id.starts_with("inferred-"));
        let (task_id_again, _) = assign(&recency, "api.anthropic.com", &headers, None, &fields(), 5);
        assert_eq!(task_id, task_id_again);
    }

    #[test]
    fn different_hosts_get_independent_inference() {
        let recency = TaskRecencyMap::new();
        let headers = HashMap::new();
        let (a, _) = assign(&recency, "api.anthropic.com", &headers, None, &fields(), 5);
        let (b, _) = assign(&recency, "api.openai.com", &headers, None, &fields(), 5);
        assert_ne!(a, b);
    }
}
