//! Configuration parsing and validation.
//!
//! The indexer is configured via a TOML file (default: `config/rix.toml`).
//! Every section except `[db]` may be omitted and falls back to defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/rix.sqlite"
//!
//! [indexing]
//! workers = 4
//! poll_interval_secs = 5
//! clone_dir = "./data/checkouts"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [cache]
//! max_entries = 100000
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use repo_indexer_core::embedding::BatchLimits;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub git: GitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Attempts per unit of work, including the first.
    #[serde(default = "default_db_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_db_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    10
}

impl DbConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_retries: default_db_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_clone_dir")]
    pub clone_dir: PathBuf,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Directory names skipped in addition to the built-in list.
    #[serde(default)]
    pub skip_dirs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_workers() -> usize {
    2
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_clone_dir() -> PathBuf {
    PathBuf::from("./data/checkouts")
}
fn default_max_file_size() -> u64 {
    1024 * 1024
}
fn default_stale_after_secs() -> u64 {
    3600
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_secs: default_poll_interval_secs(),
            clone_dir: default_clone_dir(),
            max_file_size_bytes: default_max_file_size(),
            skip_dirs: Vec::new(),
            exclude_globs: Vec::new(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl IndexingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

fn default_max_tokens() -> usize {
    500
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_item_chars")]
    pub max_item_chars: usize,
    #[serde(default = "default_max_batch_chars")]
    pub max_batch_chars: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_item_chars: default_max_item_chars(),
            max_batch_chars: default_max_batch_chars(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    2048
}
fn default_max_item_chars() -> usize {
    32_000
}
fn default_max_batch_chars() -> usize {
    32_000 * 4
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn limits(&self) -> BatchLimits {
        BatchLimits {
            max_items: self.batch_size,
            max_item_chars: self.max_item_chars,
            max_batch_chars: self.max_batch_chars,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    #[serde(default = "default_evict_fraction")]
    pub evict_fraction: f64,
}

fn default_max_entries() -> u64 {
    100_000
}
fn default_evict_fraction() -> f64 {
    0.1
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            evict_fraction: default_evict_fraction(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitConfig {
    /// Name of an environment variable holding an access token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_shallow")]
    pub shallow: bool,
}

fn default_shallow() -> bool {
    true
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            token_env: None,
            shallow: default_shallow(),
        }
    }
}

impl GitConfig {
    /// Token from the configured environment variable, if set and non-empty.
    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty())
    }
}

impl Config {
    /// Defaults everywhere, database at `db_path`.
    pub fn with_db(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig::at(db_path),
            indexing: IndexingConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            git: GitConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            bail!("db.max_connections must be >= 1");
        }
        if self.db.max_retries == 0 {
            bail!("db.max_retries must be >= 1");
        }

        if self.indexing.workers == 0 {
            bail!("indexing.workers must be >= 1");
        }
        if self.indexing.poll_interval_secs == 0 {
            bail!("indexing.poll_interval_secs must be >= 1");
        }

        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }

        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be >= 1");
        }
        if !(self.cache.evict_fraction > 0.0 && self.cache.evict_fraction <= 1.0) {
            bail!("cache.evict_fraction must be in (0.0, 1.0]");
        }

        let e = &self.embedding;
        if e.batch_size == 0 || e.max_item_chars == 0 || e.max_batch_chars == 0 {
            bail!("embedding batch limits must all be > 0");
        }
        match e.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if e.is_enabled() {
            if e.dims.is_none() || e.dims == Some(0) {
                bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
            }
            if e.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                );
            }
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
