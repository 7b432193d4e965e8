//! Tracing setup: `EnvFilter` (`RUST_LOG` overrides the configured level),
//! a stdout `fmt` layer always on, and an optional daily-rotating file
//! layer when `logging.file_enabled` is set. No TUI capture layer here —
//! Langley runs headless.

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking file appender's background writer alive for the
/// process lifetime; dropping it would silently stop flushing.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(config: &LoggingConfig) -> LoggingGuard {
    let default_filter = format!("langley={}", config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if config.file_enabled {
        if let Err(e) = std::fs::create_dir_all(&config.file_dir) {
            tracing::warn!("could not create log directory {}: {e}", config.file_dir.display());
        } else {
            let appender = tracing_appender::rolling::daily(&config.file_dir, "langley.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            return LoggingGuard { _file_guard: Some(guard) };
        }
    }

    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();
    LoggingGuard { _file_guard: None }
}
