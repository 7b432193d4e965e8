//! Configuration for the proxy server
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (`config.yaml` in the platform config directory)
//! 3. Built-in defaults (lowest priority)
//!
//! Loading the YAML file itself is an external collaborator (the CLI owns
//! bootstrap and first-run creation); this module defines the resulting
//! struct tree, its defaults, and the environment-variable overlay, which
//! are the parts of configuration the data plane actually depends on.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

mod file;

pub use file::FileConfig;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub persistence: PersistenceConfig,
    pub retention: RetentionConfig,
    pub redaction: RedactionConfig,
    pub task: TaskConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    /// Directory holding `ca.crt`, `ca.key`, `langley.db`, `config.yaml`, `state.json`
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "ProxyConfig::default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub intercept_hosts: Vec<String>,
}

impl ProxyConfig {
    fn default_listen() -> SocketAddr {
        "127.0.0.1:9090".parse().expect("valid default listen addr")
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            intercept_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "PersistenceConfig::default_body_max_bytes")]
    pub body_max_bytes: usize,
    #[serde(default = "PersistenceConfig::default_event_batch_size")]
    pub event_batch_size: usize,
    #[serde(default = "PersistenceConfig::default_event_batch_timeout_ms")]
    pub event_batch_timeout_ms: u64,
    #[serde(default = "PersistenceConfig::default_queue_max_size")]
    pub queue_max_size: usize,
}

impl PersistenceConfig {
    fn default_body_max_bytes() -> usize {
        1024 * 1024
    }
    fn default_event_batch_size() -> usize {
        50
    }
    fn default_event_batch_timeout_ms() -> u64 {
        250
    }
    fn default_queue_max_size() -> usize {
        200
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            body_max_bytes: Self::default_body_max_bytes(),
            event_batch_size: Self::default_event_batch_size(),
            event_batch_timeout_ms: Self::default_event_batch_timeout_ms(),
            queue_max_size: Self::default_queue_max_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "RetentionConfig::default_days")]
    pub flows_ttl_days: i64,
    #[serde(default = "RetentionConfig::default_days")]
    pub events_ttl_days: i64,
    #[serde(default = "RetentionConfig::default_days")]
    pub bodies_ttl_days: i64,
    #[serde(default = "RetentionConfig::default_drop_log_days")]
    pub drop_log_ttl_days: i64,
}

impl RetentionConfig {
    fn default_days() -> i64 {
        30
    }
    fn default_drop_log_days() -> i64 {
        7
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            flows_ttl_days: Self::default_days(),
            events_ttl_days: Self::default_days(),
            bodies_ttl_days: Self::default_days(),
            drop_log_ttl_days: Self::default_drop_log_days(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedactionConfig {
    #[serde(default)]
    pub always_redact_headers: Vec<String>,
    #[serde(default)]
    pub pattern_redact_headers: Vec<String>,
    #[serde(default = "default_true")]
    pub redact_api_keys: bool,
    #[serde(default = "default_true")]
    pub redact_base64_images: bool,
    #[serde(default)]
    pub raw_body_storage: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "TaskConfig::default_idle_gap_minutes")]
    pub idle_gap_minutes: i64,
    #[serde(default = "TaskConfig::default_metadata_fields")]
    pub metadata_fields: Vec<String>,
}

impl TaskConfig {
    fn default_idle_gap_minutes() -> i64 {
        5
    }
    fn default_metadata_fields() -> Vec<String> {
        vec![
            "metadata.user_id".to_string(),
            "user".to_string(),
            "metadata.userId".to_string(),
        ]
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            idle_gap_minutes: Self::default_idle_gap_minutes(),
            metadata_fields: Self::default_metadata_fields(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    #[serde(default)]
    pub file_enabled: bool,
    #[serde(default = "LoggingConfig::default_file_dir")]
    pub file_dir: PathBuf,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
    fn default_file_dir() -> PathBuf {
        PathBuf::from("./logs")
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            file_enabled: false,
            file_dir: Self::default_file_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            persistence: PersistenceConfig::default(),
            retention: RetentionConfig::default(),
            redaction: RedactionConfig::default(),
            task: TaskConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            data_dir: Config::default_data_dir(),
        }
    }
}

impl Config {
    fn default_data_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("langley"))
            .unwrap_or_else(|| PathBuf::from(".langley"))
    }

    /// Path to the YAML config file within the data directory.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("langley").join("config.yaml"))
    }

    /// Load configuration from the YAML file (if present) overlaid with
    /// environment variable overrides. Fails fast (`ConfigError`, §7) on a
    /// malformed file - configuration errors are only ever encountered at
    /// startup and are always fatal.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => {
                let file = FileConfig::load(&path)?;
                file.into_config(Self::default_data_dir())
            }
            _ => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `LANGLEY_*` and `RUST_LOG` environment overrides, highest
    /// precedence over both the file and the built-in defaults.
    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("LANGLEY_LISTEN") {
            match listen.parse() {
                Ok(addr) => self.proxy.listen = addr,
                Err(e) => tracing::warn!(error = %e, "ignoring invalid LANGLEY_LISTEN"),
            }
        }
        if let Ok(db_path) = std::env::var("LANGLEY_DB_PATH") {
            self.data_dir = PathBuf::from(db_path)
                .parent()
                .map(PathBuf::from)
                .unwrap_or(self.data_dir.clone());
        }
        if let Ok(token) = std::env::var("LANGLEY_AUTH_TOKEN") {
            self.auth.token = Some(token);
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("langley.db")
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.data_dir.join("ca.crt")
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.data_dir.join("ca.key")
    }
}
