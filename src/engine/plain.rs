//! The PLAIN request state machine: READ_REQUEST -> SAVE_FLOW -> FORWARD,
//! then handing off to `tee` for STREAM_RESPONSE/FINALIZE. Shared by the
//! direct plain-HTTP-proxy path and the per-request loop running inside an
//! already-established MITM tunnel -- the two differ only in how the
//! target host and upstream scheme are resolved.

use super::{classify_upstream_error, full_body, ConnCtx, Engine, RespBody};
use crate::error::EngineError;
use crate::model::{Flow, FlowIntegrity, Provider};
use crate::{providers, redact, tasks, tools};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{HeaderMap, Request, Response, StatusCode};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::time::Instant;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

fn monotonic_ns(now: Instant) -> i64 {
    now.saturating_duration_since(*PROCESS_START).as_nanos() as i64
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "accept-encoding",
    "host",
];

/// Header names listed inside a `Connection` header are hop-by-hop too,
/// even though they aren't on the fixed list.
fn connection_header_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn header_map_to_model(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.entry(name.as_str().to_lowercase()).or_default().push(v.to_string());
        }
    }
    map
}

/// Resolve the target host: inside a tunnel it's already known from the
/// CONNECT line, otherwise it comes from the request's absolute-form URI
/// or, failing that, the `Host` header.
fn resolve_host<B>(ctx: &ConnCtx, req: &Request<B>) -> Result<String, anyhow::Error> {
    if let Some(target) = &ctx.tunnel_target {
        return Ok(target.host.clone());
    }
    if let Some(host) = req.uri().host() {
        return Ok(host.to_string());
    }
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string())
        .ok_or_else(|| anyhow::anyhow!("request carries no host information"))
}

fn build_upstream_url<B>(ctx: &ConnCtx, host: &str, req: &Request<B>) -> String {
    let path = req.uri().path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string());
    if let Some(target) = &ctx.tunnel_target {
        if target.port == 443 {
            format!("https://{host}{path}")
        } else {
            format!("https://{host}:{}{path}", target.port)
        }
    } else if let Some(authority) = req.uri().authority() {
        let scheme = req.uri().scheme_str().unwrap_or("http");
        format!("{scheme}://{authority}{path}")
    } else {
        format!("http://{host}{path}")
    }
}

fn build_upstream_request(
    engine: &Engine,
    method: &str,
    url: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<reqwest::Request, anyhow::Error> {
    let method = reqwest::Method::from_bytes(method.as_bytes())?;
    let mut builder = engine.inner.client.request(method, url);

    let connection_listed = connection_header_names(headers);
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || connection_listed.iter().any(|n| n == &lower) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            builder = builder.header(name.as_str(), v);
        }
    }

    Ok(builder.body(body).build()?)
}

/// A 502 for requests that never made it to FINALIZE: the flow (if saved
/// at all) is updated in place so it still shows up as `interrupted`
/// rather than silently hanging around `in_flight` forever.
async fn finalize_failure(engine: &Engine, mut flow: Flow, start: Instant, integrity: FlowIntegrity) -> Response<RespBody> {
    flow.flow_integrity = integrity;
    flow.duration_ms = Some(start.elapsed().as_millis() as i64);
    if let Err(e) = engine.inner.store.update_flow(flow.clone()).await {
        let transient = e.is_transient();
        let err = EngineError::Store(e);
        if transient {
            tracing::warn!(flow_id = %flow.id, error = %err, "failed to update flow after forward failure");
        } else {
            tracing::error!(flow_id = %flow.id, error = %err, "failed to update flow after forward failure");
        }
    }
    engine.inner.broadcaster.on_flow_updated(&flow);
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("content-type", "text/plain")
        .body(full_body("upstream request failed"))
        .expect("static response is valid")
}

pub(super) async fn handle_plain(ctx: &ConnCtx, req: Request<Incoming>) -> Result<Response<RespBody>, anyhow::Error> {
    let start = Instant::now();
    let start_mono_ns = monotonic_ns(start);
    let method = req.method().to_string();
    let headers = req.headers().clone();

    let host = resolve_host(ctx, &req)?;
    let url = build_upstream_url(ctx, &host, &req);
    let path = req.uri().path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string());

    // READ_REQUEST
    let body_bytes = req.into_body().collect().await?.to_bytes();

    let settings = &ctx.engine.inner.settings;
    let request_headers = header_map_to_model(&headers);
    let request_body_truncated = body_bytes.len() > settings.body_max_bytes;

    // SAVE_FLOW
    let mut flow = Flow::new(host.clone(), method.clone(), path, url.clone(), start_mono_ns);
    flow.provider = providers::detect(&host).unwrap_or(Provider::Other);
    if settings.flows_ttl_days > 0 {
        flow.expires_at = Some(flow.created_at + chrono::Duration::days(settings.flows_ttl_days));
    }

    let (task_id, task_source) = tasks::assign(
        &ctx.engine.inner.recency,
        &host,
        &request_headers,
        Some(body_bytes.as_ref()),
        &settings.metadata_fields,
        settings.idle_gap_minutes,
    );
    flow.task_id = Some(task_id);
    flow.task_source = Some(task_source);
    flow.request_headers = redact::redact_headers(&request_headers, &settings.always_redact_headers, &settings.header_redact_patterns);
    flow.request_body_truncated = request_body_truncated;

    if redact::should_store_body(settings.raw_body_storage) {
        let take = body_bytes.len().min(settings.body_max_bytes);
        let body_str = String::from_utf8_lossy(&body_bytes[..take]).into_owned();
        flow.request_body = Some(redact::redact_body(&body_str, settings.redact_api_keys, settings.redact_base64_images, &[]));
    }

    let store = ctx.engine.inner.store.clone();
    let broadcaster = ctx.engine.inner.broadcaster.clone();
    match store.save_flow(flow.clone()).await {
        Ok(()) => broadcaster.on_flow_started(&flow),
        Err(e) => {
            let transient = e.is_transient();
            let err = EngineError::Store(e);
            if transient {
                tracing::warn!(flow_id = %flow.id, error = %err, "failed to persist flow");
            } else {
                tracing::error!(flow_id = %flow.id, error = %err, "failed to persist flow");
            }
        }
    }

    for result in tools::extract_tool_results(&body_bytes) {
        let (success, duration_ms, error_message) = tools::apply_result(&result, flow.timestamp);
        if let Err(e) = store
            .update_tool_result(result.tool_use_id.clone(), success, Some(duration_ms), error_message)
            .await
        {
            let err = EngineError::Store(e);
            tracing::warn!(flow_id = %flow.id, tool_use_id = %result.tool_use_id, error = %err, "failed to update tool result");
        }
    }

    // FORWARD
    let upstream_req = match build_upstream_request(&ctx.engine, &method, &url, &headers, body_bytes.clone()) {
        Ok(r) => r,
        Err(e) => {
            let err = EngineError::UpstreamUnreachable(e.to_string());
            tracing::warn!(flow_id = %flow.id, host = %host, error = %err, "could not build upstream request");
            return Ok(finalize_failure(&ctx.engine, flow, start, FlowIntegrity::Interrupted).await);
        }
    };

    let response = match ctx.engine.inner.client.execute(upstream_req).await {
        Ok(r) => r,
        Err(e) => {
            let err = classify_upstream_error(&e);
            tracing::warn!(flow_id = %flow.id, host = %host, error = %err, "upstream request failed");
            return Ok(finalize_failure(&ctx.engine, flow, start, FlowIntegrity::Interrupted).await);
        }
    };

    // STREAM_RESPONSE + FINALIZE
    Ok(super::tee::stream_and_finalize(ctx.engine.clone(), flow, start, response).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel_ctx(engine: &Engine, target_host: &str) -> ConnCtx {
        ConnCtx {
            engine: engine.clone(),
            peer_ip: "127.0.0.1".parse().unwrap(),
            inside_tunnel: true,
            tunnel_target: Some(super::super::TunnelTarget { host: target_host.to_string(), port: 443 }),
        }
    }

    #[test]
    fn hop_by_hop_headers_are_stripped_and_connection_listed_ones_too() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::CONNECTION, "x-custom".parse().unwrap());
        headers.insert("x-custom", "drop-me".parse().unwrap());
        headers.insert("x-keep", "keep-me".parse().unwrap());
        let listed = connection_header_names(&headers);
        assert_eq!(listed, vec!["x-custom".to_string()]);
    }

    #[test]
    fn header_map_to_model_lowercases_names_and_preserves_multi_values() {
        let mut headers = HeaderMap::new();
        headers.append("X-Trace-Id", "a".parse().unwrap());
        headers.append("X-Trace-Id", "b".parse().unwrap());
        let model = header_map_to_model(&headers);
        assert_eq!(model.get("x-trace-id").unwrap(), &vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn resolve_host_prefers_tunnel_target_over_uri_and_host_header() {
        let engine = test_engine();
        let ctx = tunnel_ctx(&engine, "api.anthropic.com");
        let req = Request::builder().uri("/v1/messages").body(()).unwrap();
        assert_eq!(resolve_host(&ctx, &req).unwrap(), "api.anthropic.com");
    }

    #[test]
    fn resolve_host_falls_back_to_host_header_outside_a_tunnel() {
        let engine = test_engine();
        let ctx = ConnCtx { engine, peer_ip: "127.0.0.1".parse().unwrap(), inside_tunnel: false, tunnel_target: None };
        let req = Request::builder().uri("/").header(hyper::header::HOST, "example.com:8080").body(()).unwrap();
        assert_eq!(resolve_host(&ctx, &req).unwrap(), "example.com");
    }

    #[test]
    fn resolve_host_errors_with_no_host_information_at_all() {
        let engine = test_engine();
        let ctx = ConnCtx { engine, peer_ip: "127.0.0.1".parse().unwrap(), inside_tunnel: false, tunnel_target: None };
        let req = Request::builder().uri("/").body(()).unwrap();
        assert!(resolve_host(&ctx, &req).is_err());
    }

    #[test]
    fn build_upstream_url_uses_https_and_default_port_inside_a_tunnel() {
        let engine = test_engine();
        let ctx = tunnel_ctx(&engine, "api.anthropic.com");
        let req = Request::builder().uri("/v1/messages?beta=1").body(()).unwrap();
        assert_eq!(build_upstream_url(&ctx, "api.anthropic.com", &req), "https://api.anthropic.com/v1/messages?beta=1");
    }

    #[test]
    fn build_upstream_url_keeps_nonstandard_port_inside_a_tunnel() {
        let engine = test_engine();
        let ctx = ConnCtx {
            engine,
            peer_ip: "127.0.0.1".parse().unwrap(),
            inside_tunnel: true,
            tunnel_target: Some(super::super::TunnelTarget { host: "internal.example.com".to_string(), port: 8443 }),
        };
        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(build_upstream_url(&ctx, "internal.example.com", &req), "https://internal.example.com:8443/");
    }

    fn test_engine() -> Engine {
        crate::engine::test_support::test_engine()
    }
}
