//! Provider registry: detects which LLM API family a host belongs to and
//! extracts token usage from its responses.
//!
//! The set of providers is closed, so this is a sum type with dispatch
//! rather than a trait object registry (per the interface-polymorphism
//! design note: sum-type dispatch where the set is closed, trait objects
//! only where substitution matters, as it does for the store).

use crate::model::{Provider, Usage};
use serde_json::Value;

/// First-match-wins ordered list of built-in providers.
const REGISTRY: &[Provider] = &[Provider::Anthropic, Provider::Openai, Provider::Bedrock, Provider::Gemini];

/// Detect which built-in provider owns `host`, if any.
pub fn detect(host: &str) -> Option<Provider> {
    REGISTRY.iter().copied().find(|p| detect_host(*p, host))
}

fn detect_host(provider: Provider, host: &str) -> bool {
    let host = strip_port(host).to_lowercase();
    match provider {
        Provider::Anthropic => match_domain_suffix(&host, "anthropic.com"),
        Provider::Openai => match_domain_suffix(&host, "openai.com"),
        Provider::Bedrock => match_domain_suffix(&host, "amazonaws.com") && host.contains("bedrock"),
        Provider::Gemini => {
            match_domain_suffix(&host, "googleapis.com") && host.contains("generativelanguage")
        }
        Provider::Other => false,
    }
}

/// Should this host be intercepted at all: either a built-in provider, or
/// present in the user's `intercept_hosts` configuration via domain-suffix
/// matching. This is the only acceptable host-match function; substring
/// matching is forbidden (it would let `misanthropic.com` match
/// `anthropic.com`).
pub fn should_intercept(host: &str, intercept_hosts: &[String]) -> bool {
    detect(host).is_some() || intercept_hosts.iter().any(|suffix| match_domain_suffix(host, suffix))
}

/// `match(host, suffix)`: strip an optional `:port`, lowercase both sides,
/// true iff `host == suffix` or `host` ends with `"." + suffix`.
pub fn match_domain_suffix(host: &str, suffix: &str) -> bool {
    let host = strip_port(host).to_lowercase();
    let suffix = strip_port(suffix).to_lowercase();
    host == suffix || host.ends_with(&format!(".{suffix}"))
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => h,
        _ => host,
    }
}

/// Extract usage from a captured (non-SSE) response body. For SSE
/// responses, usage should instead come from the SSE parser's
/// `extract_usage` over the accumulated event list, since that already did
/// the JSON parsing once; this path exists for the non-streaming case.
pub fn parse_usage(provider: Provider, body: &[u8], is_sse: bool) -> Usage {
    if is_sse {
        return Usage::default();
    }
    let Ok(json) = serde_json::from_slice::<Value>(body) else {
        return Usage::default();
    };
    match provider {
        Provider::Anthropic => parse_anthropic_usage(&json),
        Provider::Openai => parse_openai_usage(&json),
        Provider::Bedrock => parse_anthropic_usage(&json), // Bedrock's Anthropic models use the same usage shape
        Provider::Gemini => parse_gemini_usage(&json),
        Provider::Other => Usage::default(),
    }
}

pub fn extract_model(provider: Provider, body: &[u8]) -> Option<String> {
    let json = serde_json::from_slice::<Value>(body).ok()?;
    match provider {
        Provider::Anthropic | Provider::Bedrock => json.get("model")?.as_str().map(String::from),
        Provider::Openai => json.get("model")?.as_str().map(String::from),
        Provider::Gemini => json
            .get("modelVersion")
            .or_else(|| json.get("model"))?
            .as_str()
            .map(String::from),
        Provider::Other => None,
    }
}

fn parse_anthropic_usage(json: &Value) -> Usage {
    let usage = json.get("usage");
    Usage {
        input_tokens: usage.and_then(|u| u.get("input_tokens")).and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        output_tokens: usage.and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        cache_creation_tokens: usage
            .and_then(|u| u.get("cache_creation_input_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        cache_read_tokens: usage
            .and_then(|u| u.get("cache_read_input_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
    }
}

fn parse_openai_usage(json: &Value) -> Usage {
    let usage = json.get("usage");
    Usage {
        input_tokens: usage.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        output_tokens: usage.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        cache_creation_tokens: 0,
        cache_read_tokens: usage
            .and_then(|u| u.get("prompt_tokens_details"))
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
    }
}

fn parse_gemini_usage(json: &Value) -> Usage {
    let usage = json.get("usageMetadata");
    Usage {
        input_tokens: usage.and_then(|u| u.get("promptTokenCount")).and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        output_tokens: usage
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        cache_creation_tokens: 0,
        cache_read_tokens: usage
            .and_then(|u| u.get("cachedContentTokenCount"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_suffix_matching_rejects_crafted_hosts() {
        assert!(!match_domain_suffix("misanthropic.com", "anthropic.com"));
        assert!(match_domain_suffix("api.anthropic.com", "anthropic.com"));
        assert!(match_domain_suffix("anthropic.com:443", "anthropic.com"));
        assert!(match_domain_suffix("API.Anthropic.COM", "anthropic.com"));
        assert!(!match_domain_suffix(
            "generativelanguage.googleapis.com.evil.com",
            "generativelanguage.googleapis.com"
        ));
    }

    #[test]
    fn detects_built_in_providers() {
        assert_eq!(detect("api.anthropic.com"), Some(Provider::Anthropic));
        assert_eq!(detect("api.openai.com"), Some(Provider::Openai));
        assert_eq!(detect("bedrock-runtime.us-east-1.amazonaws.com"), Some(Provider::Bedrock));
        assert_eq!(detect("generativelanguage.googleapis.com"), Some(Provider::Gemini));
        assert_eq!(detect("s3.amazonaws.com"), None);
        assert_eq!(detect("example.com"), None);
    }

    #[test]
    fn should_intercept_honors_user_configured_suffixes() {
        assert!(should_intercept("api.anthropic.com", &[]));
        assert!(!should_intercept("example.com", &[]));
        assert!(should_intercept("internal.example.com", &["example.com".to_string()]));
    }

    #[test]
    fn parses_anthropic_non_streaming_usage() {
        let body = br#"{"model":"claude-sonnet-4","usage":{"input_tokens":100,"output_tokens":50}}"#;
        let usage = parse_usage(Provider::Anthropic, body, false);
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.output_tokens, 50);
    }
}
