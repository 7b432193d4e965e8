//! MITM engine: owns the listening socket, demultiplexes CONNECT versus
//! plain HTTP, and runs the per-connection state machines in `plain` and
//! `tunnel`. One `hyper` HTTP/1.1 connection handler (`route`) is reused
//! for both the top-level listening socket and the per-request loop served
//! inside an established MITM tunnel; `ConnCtx::inside_tunnel` is the only
//! thing that distinguishes the two, which is what makes rejecting a
//! nested `CONNECT` a one-line check rather than a second code path.

mod plain;
mod tee;
mod tunnel;

use crate::broadcast::Broadcaster;
use crate::ca::Ca;
use crate::config::Config;
use crate::error::EngineError;
use crate::ratelimit::RateLimiter;
use crate::redact;
use crate::store::Store;
use crate::tasks::TaskRecencyMap;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{info, warn};

pub use tunnel::TunnelTarget;

/// Response body type shared by every code path: the plain proxy's
/// fully-buffered error responses and the tee's chunked streaming body
/// both end up boxed to this one type so `route()` can return a single
/// concrete `Response<_>`.
pub type RespBody = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const TUNNEL_SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// Settings copied out of [`Config`] at construction time so the hot path
/// never has to walk the config tree or recompile a regex per request.
pub struct EngineSettings {
    pub intercept_hosts: Vec<String>,
    pub body_max_bytes: usize,
    pub metadata_fields: Vec<String>,
    pub idle_gap_minutes: i64,
    pub always_redact_headers: Vec<String>,
    pub header_redact_patterns: Vec<Regex>,
    pub redact_api_keys: bool,
    pub redact_base64_images: bool,
    pub raw_body_storage: bool,
    pub flows_ttl_days: i64,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            intercept_hosts: config.proxy.intercept_hosts.clone(),
            body_max_bytes: config.persistence.body_max_bytes,
            metadata_fields: config.task.metadata_fields.clone(),
            idle_gap_minutes: config.task.idle_gap_minutes,
            always_redact_headers: config.redaction.always_redact_headers.clone(),
            header_redact_patterns: redact::compile_header_patterns(&config.redaction.pattern_redact_headers),
            redact_api_keys: config.redaction.redact_api_keys,
            redact_base64_images: config.redaction.redact_base64_images,
            raw_body_storage: config.redaction.raw_body_storage,
            flows_ttl_days: config.retention.flows_ttl_days,
        }
    }
}

struct EngineInner {
    ca: Arc<Ca>,
    store: Arc<Store>,
    broadcaster: Arc<dyn Broadcaster>,
    rate_limiter: Arc<RateLimiter>,
    client: reqwest::Client,
    recency: TaskRecencyMap,
    settings: EngineSettings,
    tunnels: tunnel::TunnelRegistry,
    next_conn_id: AtomicU64,
}

/// Shared, cheaply-cloned handle to the engine; every connection task and
/// every component it drives (redactor, store, broadcaster, rate limiter)
/// is reached through this.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Per-connection context threaded through `route()`.
#[derive(Clone)]
pub(crate) struct ConnCtx {
    pub(crate) engine: Engine,
    pub(crate) peer_ip: IpAddr,
    pub(crate) inside_tunnel: bool,
    /// Known only inside a tunnel: the CONNECT target this connection was
    /// already scoped to when the tunnel was established.
    pub(crate) tunnel_target: Option<TunnelTarget>,
}

impl Engine {
    pub fn new(
        ca: Arc<Ca>,
        store: Arc<Store>,
        broadcaster: Arc<dyn Broadcaster>,
        rate_limiter: Arc<RateLimiter>,
        settings: EngineSettings,
    ) -> anyhow::Result<Self> {
        // Upstream TLS validation (pinned webpki roots, certificate chain
        // checks, ALPN restriction) is reqwest's job here, not ours: its
        // rustls-tls feature already does this, so the engine never talks
        // raw TLS to an upstream host.
        let client = reqwest::Client::builder()
            .connect_timeout(DIAL_TIMEOUT)
            .timeout(std::time::Duration::from_secs(300))
            .pool_max_idle_per_host(10)
            .http1_only()
            .build()?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                ca,
                store,
                broadcaster,
                rate_limiter,
                client,
                recency: TaskRecencyMap::new(),
                settings,
                tunnels: tunnel::TunnelRegistry::default(),
                next_conn_id: AtomicU64::new(0),
            }),
        })
    }

    /// Accept connections on `listen` until `shutdown` resolves. Stops
    /// accepting immediately on shutdown, then waits up to
    /// `TUNNEL_SHUTDOWN_GRACE` for in-flight tunnel/passthrough tasks to
    /// finish on their own before force-aborting whatever is still left.
    pub async fn run(self, listen: SocketAddr, mut shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(listen).await?;
        info!("mitm engine listening on {listen}");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("accept error: {e}");
                            continue;
                        }
                    };
                    let engine = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = engine.serve_top_level(stream, peer).await {
                            warn!("connection from {peer} ended with error: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("shutdown requested, no longer accepting new connections");
                    break;
                }
            }
        }

        // Give in-flight tunnel/passthrough tasks a chance to finish and
        // untrack themselves naturally, up to the shutdown deadline, before
        // force-aborting whatever is still left.
        let deadline = tokio::time::Instant::now() + TUNNEL_SHUTDOWN_GRACE;
        while !self.inner.tunnels.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.inner.tunnels.abort_all();
        Ok(())
    }

    async fn serve_top_level(self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        stream.set_nodelay(true).ok();
        let ctx = ConnCtx { engine: self, peer_ip: peer.ip(), inside_tunnel: false, tunnel_target: None };
        let io = TokioIo::new(stream);
        http1::Builder::new()
            .serve_connection(io, service_fn(move |req| route(ctx.clone(), req)))
            .with_upgrades()
            .await?;
        Ok(())
    }

    async fn handle_connect(self, mut req: Request<Incoming>, peer_ip: IpAddr) -> Response<RespBody> {
        let Some(target) = TunnelTarget::from_connect(&req) else {
            return simple_response(StatusCode::BAD_REQUEST, "malformed CONNECT target");
        };

        if !self.inner.rate_limiter.check(peer_ip) {
            return simple_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
        }

        let intercept = crate::providers::should_intercept(&target.host, &self.inner.settings.intercept_hosts);
        if intercept {
            self.spawn_mitm_tunnel(req, target, peer_ip)
        } else {
            // The upstream dial must happen before the 200 is sent: the
            // caller needs to know dial failure turned into a 502, not a
            // broken tunnel the client thinks is live.
            match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect((target.host.as_str(), target.port))).await {
                Ok(Ok(upstream)) => {
                    let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let registry = self.inner.tunnels.clone();
                    tokio::spawn(async move {
                        match hyper::upgrade::on(&mut req).await {
                            Ok(upgraded) => {
                                tunnel::run_passthrough(conn_id, registry, TokioIo::new(upgraded), upstream).await;
                            }
                            Err(e) => warn!("CONNECT upgrade failed for passthrough tunnel: {e}"),
                        }
                    });
                    Response::builder().status(StatusCode::OK).body(empty_body()).expect("static response is valid")
                }
                _ => simple_response(StatusCode::BAD_GATEWAY, "could not reach upstream"),
            }
        }
    }

    fn spawn_mitm_tunnel(self, mut req: Request<Incoming>, target: TunnelTarget, peer_ip: IpAddr) -> Response<RespBody> {
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let engine = self;
        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => {
                    if let Err(e) = tunnel::run_mitm(conn_id, engine, TokioIo::new(upgraded), target.clone(), peer_ip).await {
                        warn!("MITM tunnel for {} failed: {e}", target.host);
                    }
                }
                Err(e) => warn!("CONNECT upgrade failed for MITM tunnel: {e}"),
            }
        });
        Response::builder().status(StatusCode::OK).body(empty_body()).expect("static response is valid")
    }
}

/// Shared by the top-level listening socket and the per-request loop
/// inside an MITM tunnel. `ctx.inside_tunnel` is the only branch: a nested
/// `CONNECT` is rejected outright rather than recursively tunneled.
pub(crate) async fn route(ctx: ConnCtx, req: Request<Incoming>) -> Result<Response<RespBody>, std::convert::Infallible> {
    if req.method() == Method::CONNECT {
        if ctx.inside_tunnel {
            return Ok(simple_response(StatusCode::METHOD_NOT_ALLOWED, "CONNECT not allowed inside an established tunnel"));
        }
        return Ok(ctx.engine.clone().handle_connect(req, ctx.peer_ip).await);
    }

    match plain::handle_plain(&ctx, req).await {
        Ok(resp) => Ok(resp),
        Err(e) => {
            warn!("plain request handling failed: {e}");
            Ok(simple_response(StatusCode::BAD_GATEWAY, "upstream request failed"))
        }
    }
}

/// Classify a `reqwest` error against the upstream-facing taxonomy kinds.
/// `reqwest` doesn't expose a dedicated "TLS handshake failed" predicate, so
/// a connect-phase error is treated as a TLS failure when its source chain
/// mentions TLS/certificate problems, and as a plain dial/DNS failure
/// otherwise.
pub(crate) fn classify_upstream_error(e: &reqwest::Error) -> EngineError {
    if e.is_connect() {
        let mut source = std::error::Error::source(e);
        while let Some(err) = source {
            let msg = err.to_string().to_lowercase();
            if msg.contains("tls") || msg.contains("certificate") || msg.contains("handshake") {
                return EngineError::UpstreamTlsError(e.to_string());
            }
            source = err.source();
        }
    }
    EngineError::UpstreamUnreachable(e.to_string())
}

pub(crate) fn full_body(data: impl Into<Bytes>) -> RespBody {
    Full::new(data.into()).map_err(|never: std::convert::Infallible| match never {}).boxed()
}

fn empty_body() -> RespBody {
    full_body(Bytes::new())
}

fn simple_response(status: StatusCode, message: &'static str) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(full_body(message))
        .expect("static response is valid")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::broadcast::NullBroadcaster;

    pub(crate) fn test_engine() -> Engine {
        let dir = std::env::temp_dir().join(format!("langley-engine-test-{}-{}", std::process::id(), uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let ca = Arc::new(Ca::load_or_create(&dir.join("ca.crt"), &dir.join("ca.key"), None).unwrap());
        let store = Arc::new(Store::open(&dir.join("langley.db")).unwrap());
        let broadcaster: Arc<dyn Broadcaster> = Arc::new(NullBroadcaster);
        let rate_limiter = Arc::new(RateLimiter::new(20.0, 5.0));
        let settings = EngineSettings {
            intercept_hosts: vec![],
            body_max_bytes: 1_000_000,
            metadata_fields: vec!["metadata.user_id".to_string()],
            idle_gap_minutes: 5,
            always_redact_headers: vec!["authorization".to_string()],
            header_redact_patterns: vec![],
            redact_api_keys: true,
            redact_base64_images: true,
            raw_body_storage: true,
            flows_ttl_days: 30,
        };
        Engine::new(ca, store, broadcaster, rate_limiter, settings).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_settings_from_config_copies_every_field() {
        let config = Config::default();
        let settings = EngineSettings::from_config(&config);
        assert_eq!(settings.intercept_hosts, config.proxy.intercept_hosts);
        assert_eq!(settings.body_max_bytes, config.persistence.body_max_bytes);
        assert_eq!(settings.flows_ttl_days, config.retention.flows_ttl_days);
    }

    #[test]
    fn simple_response_sets_status_and_plain_text_content_type() {
        let resp = simple_response(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    }
}
