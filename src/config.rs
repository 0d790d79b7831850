//! TOML configuration.
//!
//! Every key has a default, so a missing `--config` flag is valid and the
//! service runs from defaults plus CLI overrides. See [`load_config`] for the
//! validation rules.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest writer heap the index engine accepts.
pub const MIN_WRITER_HEAP_BYTES: usize = 15_000_000;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// The JSON metadata feed and how its changes are observed.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_source_path")]
    pub path: PathBuf,
    /// Quiescence window between the first write event and the reload.
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
}

impl SourceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_source_path(),
            debounce_secs: default_debounce_secs(),
        }
    }
}

fn default_source_path() -> PathBuf {
    PathBuf::from("metadata.json")
}
fn default_debounce_secs() -> u64 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Keep the index in RAM only. Every startup is then a full rebuild.
    #[serde(default)]
    pub in_memory: bool,
    #[serde(default = "default_writer_heap_bytes")]
    pub writer_heap_bytes: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            batch_size: default_batch_size(),
            in_memory: false,
            writer_heap_bytes: default_writer_heap_bytes(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from(".thiss")
}
fn default_batch_size() -> usize {
    100
}
fn default_writer_heap_bytes() -> usize {
    50_000_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Public base URL used in webfinger links. Derived from the request
    /// `Host` header when unset.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
    #[serde(default = "default_webfinger_ttl_secs")]
    pub webfinger_ttl_secs: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            base_url: None,
            search_limit: default_search_limit(),
            webfinger_ttl_secs: default_webfinger_ttl_secs(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_search_limit() -> usize {
    100
}
fn default_webfinger_ttl_secs() -> i64 {
    3600
}

impl Config {
    /// Checks the invariants the rest of the service relies on.
    pub fn validate(&self) -> Result<()> {
        if self.source.path.as_os_str().is_empty() {
            anyhow::bail!("source.path must not be empty");
        }

        if self.index.batch_size == 0 {
            anyhow::bail!("index.batch_size must be > 0");
        }

        if self.index.writer_heap_bytes < MIN_WRITER_HEAP_BYTES {
            anyhow::bail!(
                "index.writer_heap_bytes must be >= {}",
                MIN_WRITER_HEAP_BYTES
            );
        }

        if !self.index.in_memory && self.index.path.as_os_str().is_empty() {
            anyhow::bail!("index.path must not be empty unless index.in_memory is set");
        }

        if self.server.search_limit == 0 {
            anyhow::bail!("server.search_limit must be >= 1");
        }

        if self.server.webfinger_ttl_secs < 0 {
            anyhow::bail!("server.webfinger_ttl_secs must not be negative");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
