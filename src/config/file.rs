//! On-disk YAML representation of [`Config`](super::Config).
//!
//! The full YAML schema and its defaulting/merge behavior are an external
//! collaborator (bootstrap owns writing this file during `setup`); this is
//! the minimal deserialization shape the data plane needs in order to read
//! back what bootstrap wrote.

use super::{AuthConfig, Config, LoggingConfig, PersistenceConfig, ProxyConfig, RedactionConfig, RetentionConfig, TaskConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub data_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn into_config(self, default_data_dir: PathBuf) -> Config {
        Config {
            proxy: self.proxy,
            persistence: self.persistence,
            retention: self.retention,
            redaction: self.redaction,
            task: self.task,
            auth: self.auth,
            logging: self.logging,
            data_dir: self.data_dir.unwrap_or(default_data_dir),
        }
    }
}
