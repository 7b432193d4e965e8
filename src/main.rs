// Langley - Observability Proxy for LLM API Traffic
//
// Terminates TLS for recognized provider hosts (Anthropic, OpenAI, Bedrock,
// Gemini) via a dynamic CA, transparently tunnels everything else, and
// records the full request/response lifecycle - including streamed SSE -
// to a durable store while publishing live updates to any attached
// subscriber.

mod ca;
mod cli;
mod config;
mod engine;
mod error;
mod logging;
mod pricing;
mod providers;
mod ratelimit;
mod redact;
mod sse;
mod startup;
mod store;
mod tasks;
mod tools;
mod util;

mod broadcast;
mod model;

use anyhow::{Context, Result};
use broadcast::QueuedBroadcaster;
use config::Config;
use engine::{Engine, EngineSettings};
use ratelimit::RateLimiter;
use std::sync::Arc;
use store::Store;

/// Token-bucket defaults: not config-surfaced, since tuning request burst
/// tolerance per deployment hasn't come up as a need yet.
const RATE_LIMIT_CAPACITY: f64 = 20.0;
const RATE_LIMIT_REFILL_PER_SEC: f64 = 5.0;
const BROADCAST_QUEUE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    if cli::handle_cli()? {
        return Ok(());
    }

    let config = Config::load().context("loading configuration")?;
    let _logging_guard = logging::init(&config.logging);

    startup::print_startup(&config);
    startup::log_startup(&config);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    let ca = Arc::new(
        ca::Ca::load_or_create(&config.ca_cert_path(), &config.ca_key_path(), None)
            .context("loading or creating CA root")?,
    );

    let store = Arc::new(Store::open(&config.db_path()).context("opening durable store")?);
    store.seed_pricing(pricing::seed_rows()).await.context("seeding pricing table")?;

    let (broadcaster, mut broadcast_rx) = QueuedBroadcaster::new(BROADCAST_QUEUE_CAPACITY, store.clone());
    let broadcaster: Arc<dyn broadcast::Broadcaster> = Arc::new(broadcaster);
    // No REST/WebSocket subscriber layer lives in this crate (out of scope
    // per the data-plane boundary); drain the channel so a closed receiver
    // never silently stops the broadcaster from accepting new messages.
    tokio::spawn(async move { while broadcast_rx.recv().await.is_some() {} });

    let rate_limiter = Arc::new(RateLimiter::new(RATE_LIMIT_CAPACITY, RATE_LIMIT_REFILL_PER_SEC));
    let eviction_handle = ratelimit::spawn_eviction_task(rate_limiter.clone());

    let settings = EngineSettings::from_config(&config);
    let engine = Engine::new(ca, store.clone(), broadcaster, rate_limiter, settings).context("building engine")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let listen = config.proxy.listen;
    let engine_handle = tokio::spawn(engine.run(listen, shutdown_rx));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutdown requested");

    let _ = shutdown_tx.send(());
    if let Err(e) = engine_handle.await.context("joining engine task")? {
        tracing::error!("engine shutdown reported an error: {e}");
    }

    eviction_handle.abort();

    let mut store = match Arc::try_unwrap(store) {
        Ok(store) => store,
        Err(_) => {
            tracing::warn!("store still referenced at shutdown; closing in place may race a late write");
            return Ok(());
        }
    };
    store.close().await;

    tracing::info!("shutdown complete");
    Ok(())
}
