//! `CONNECT` tunnel handling: the transparent passthrough path for hosts
//! nobody asked to intercept, and the MITM path that terminates TLS with a
//! CA-minted leaf certificate and re-enters `route()` for every request
//! inside the tunnel.

use super::{route, ConnCtx, Engine};
use crate::ca::LeafCertificate;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tracing::warn;

const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const COPY_BUF_SIZE: usize = 8 * 1024;

/// The host:port a `CONNECT` line named, parsed once and threaded through
/// the rest of the tunnel's lifetime.
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    pub fn from_connect<B>(req: &Request<B>) -> Option<Self> {
        let authority = req.uri().authority()?;
        Some(Self { host: authority.host().to_string(), port: authority.port_u16().unwrap_or(443) })
    }
}

/// Tracks in-flight passthrough and MITM tunnels by a per-connection id so
/// shutdown can abort them deterministically rather than waiting out their
/// idle timeouts.
#[derive(Default, Clone)]
pub(crate) struct TunnelRegistry {
    handles: Arc<Mutex<HashMap<u64, Vec<AbortHandle>>>>,
}

impl TunnelRegistry {
    pub(crate) fn track(&self, id: u64, handles: Vec<AbortHandle>) {
        self.handles.lock().expect("tunnel registry mutex poisoned").insert(id, handles);
    }

    pub(crate) fn untrack(&self, id: u64) {
        self.handles.lock().expect("tunnel registry mutex poisoned").remove(&id);
    }

    pub(crate) fn abort_all(&self) {
        let handles = self.handles.lock().expect("tunnel registry mutex poisoned");
        for pair in handles.values() {
            for handle in pair {
                handle.abort();
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.lock().expect("tunnel registry mutex poisoned").is_empty()
    }
}

/// Transparent bidirectional copy between the client and a pre-dialed
/// upstream socket, with a 5-minute idle timeout on each direction. Either
/// side closing, erroring, or going idle tears down both.
pub(crate) async fn run_passthrough<C>(conn_id: u64, registry: TunnelRegistry, client_io: C, upstream: TcpStream)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_r, client_w) = tokio::io::split(client_io);
    let (upstream_r, upstream_w) = tokio::io::split(upstream);

    let up = tokio::spawn(copy_with_idle_timeout(client_r, upstream_w));
    let down = tokio::spawn(copy_with_idle_timeout(upstream_r, client_w));
    let up_handle = up.abort_handle();
    let down_handle = down.abort_handle();

    registry.track(conn_id, vec![up_handle.clone(), down_handle.clone()]);

    tokio::select! {
        _ = up => {}
        _ = down => {}
    }
    up_handle.abort();
    down_handle.abort();
    registry.untrack(conn_id);
}

async fn copy_with_idle_timeout<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let read = match tokio::time::timeout(IDLE_TIMEOUT, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => break,
        };
        if writer.write_all(&buf[..read]).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Terminate client TLS with a CA-minted leaf bound to the CONNECT target's
/// host (known up front from the CONNECT line, not from a ClientHello SNI
/// callback — `Ca::get_certificate` is async and there's no need to parse
/// SNI when the host is already known), then serve HTTP/1.1 requests over
/// the decrypted stream through the same `route()` used at the top level,
/// with `inside_tunnel = true`.
pub(crate) async fn run_mitm<C>(
    conn_id: u64,
    engine: Engine,
    client_io: C,
    target: TunnelTarget,
    peer_ip: IpAddr,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let leaf = engine.inner.ca.get_certificate(&target.host).await?;
    let tls_config = build_server_config(&leaf)?;
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    // A handshake failure here means no request was ever parsed: the spec
    // requires closing the tunnel with no flow created, which falls out
    // naturally from propagating the error before anything else runs.
    let tls_stream = acceptor
        .accept(client_io)
        .await
        .map_err(|e| anyhow::anyhow!("client TLS handshake failed for {}: {e}", target.host))?;

    let ctx = ConnCtx { engine: engine.clone(), peer_ip, inside_tunnel: true, tunnel_target: Some(target) };
    let io = TokioIo::new(tls_stream);

    let serve = tokio::spawn(async move {
        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service_fn(move |req: Request<Incoming>| route(ctx.clone(), req)))
            .await
        {
            warn!("mitm tunnel connection error: {e}");
        }
    });

    engine.inner.tunnels.track(conn_id, vec![serve.abort_handle()]);
    let _ = serve.await;
    engine.inner.tunnels.untrack(conn_id);
    Ok(())
}

fn build_server_config(leaf: &LeafCertificate) -> anyhow::Result<rustls::ServerConfig> {
    let chain: Vec<CertificateDer<'static>> = leaf.chain_der.iter().cloned().map(CertificateDer::from).collect();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone()));

    let mut config = rustls::ServerConfig::builder().with_no_client_auth().with_single_cert(chain, key)?;
    // HTTP/2 is out of scope for this path; force 1.1 so both sides agree
    // without a second negotiation round.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::Ca;

    #[test]
    fn from_connect_defaults_to_port_443_when_unspecified() {
        let req = Request::builder().method("CONNECT").uri("api.anthropic.com").body(()).unwrap();
        let target = TunnelTarget::from_connect(&req).unwrap();
        assert_eq!(target.host, "api.anthropic.com");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn from_connect_keeps_an_explicit_port() {
        let req = Request::builder().method("CONNECT").uri("internal.example.com:8443").body(()).unwrap();
        let target = TunnelTarget::from_connect(&req).unwrap();
        assert_eq!(target.port, 8443);
    }

    #[test]
    fn from_connect_rejects_a_request_with_no_authority() {
        let req = Request::builder().method("CONNECT").uri("/no-authority").body(()).unwrap();
        assert!(TunnelTarget::from_connect(&req).is_none());
    }

    #[test]
    fn registry_abort_all_clears_every_tracked_handle_without_panicking() {
        let registry = TunnelRegistry::default();
        let a = tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
            tokio::spawn(async { tokio::time::sleep(Duration::from_secs(60)).await }).abort_handle()
        });
        registry.track(1, vec![a]);
        registry.abort_all();
        registry.untrack(1);
    }

    #[tokio::test]
    async fn build_server_config_from_a_freshly_minted_leaf_restricts_alpn_to_http11() {
        let dir = std::env::temp_dir().join(format!("langley-tunnel-test-{}-{}", std::process::id(), uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let ca = Ca::load_or_create(&dir.join("ca.crt"), &dir.join("ca.key"), None).unwrap();
        let leaf = ca.get_certificate("api.anthropic.com").await.unwrap();
        let config = build_server_config(&leaf).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
