//! TOML configuration.
//!
//! Every section and field has a default, so an empty file (or no file)
//! yields a runnable configuration. [`load_config`] parses and validates;
//! CLI flags are layered on top by the driver's option types.
//!
//! ```toml
//! [chunking]
//! max_chars = 2000
//! overlap = 200
//!
//! [embedding]
//! provider = "gemini"
//! batch_size = 32
//!
//! [vector_store]
//! backend = "qdrant"
//! url = "http://localhost:6333"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::chunk;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    pub ingest: IngestConfig,
    pub tuning: TuningConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap: usize,
    /// Files whose trimmed text is shorter than this are dropped.
    pub min_content_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            overlap: 200,
            min_content_chars: 16,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `gemini`, `openai`, `hash`, or `disabled`.
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    /// Override the provider's API base URL.
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub batch_size: usize,
    pub max_retries: u32,
    /// Linear backoff unit: attempt `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: None,
            dims: None,
            base_url: None,
            api_key_env: None,
            batch_size: 32,
            max_retries: 3,
            retry_backoff_ms: 1000,
            timeout_secs: 60,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VectorStoreConfig {
    /// `qdrant`, `sqlite`, or `memory`.
    pub backend: String,
    /// Qdrant base URL; falls back to `QDRANT_URL`, then localhost.
    pub url: Option<String>,
    pub api_key_env: String,
    /// SQLite database path for the `sqlite` backend.
    pub path: PathBuf,
    pub upsert_batch_size: usize,
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: "qdrant".to_string(),
            url: None,
            api_key_env: "QDRANT_API_KEY".to_string(),
            path: PathBuf::from("data/vectors.sqlite"),
            upsert_batch_size: 500,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub collection: String,
    /// Parse pool size.
    pub workers: usize,
    /// Embed pool size.
    pub embed_workers: usize,
    pub use_cache: bool,
    /// Dedup manifests; defaults to `<root>/../.ingest_cache`.
    pub cache_dir: Option<PathBuf>,
    pub write_parsed: bool,
    /// Parsed-text sidecars; defaults to `<root>/../parsed_corpus`.
    pub parsed_dir: Option<PathBuf>,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            collection: "library_v1".to_string(),
            workers: 4,
            embed_workers: 4,
            use_cache: true,
            cache_dir: None,
            write_parsed: false,
            parsed_dir: None,
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TuningConfig {
    pub enabled: bool,
    pub file: PathBuf,
    /// Relative change of chunk_size/overlap that suggests a retune.
    pub drift_threshold: f64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: PathBuf::from("config/tuning.json"),
            drift_threshold: 0.10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Write `<stream>-YYYYMMDD.jsonl` instead of `<stream>.jsonl`.
    pub rotate_daily: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("metrics"),
            rotate_daily: false,
        }
    }
}

/// Named presets for the numeric ingestion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Profile {
    Aggressive,
    Books,
    Conservative,
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Load `path` if given, else `./config/vfold.toml` if present, else defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => load_config(p),
        None => {
            let fallback = Path::new("config/vfold.toml");
            if fallback.exists() {
                load_config(fallback)
            } else {
                Ok(Config::default())
            }
        }
    }
}

pub fn validate(config: &Config) -> Result<()> {
    chunk::validate(config.chunking.max_chars, config.chunking.overlap)
        .context("invalid [chunking] section")?;

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }
    if config.embedding.timeout_secs == 0 {
        bail!("embedding.timeout_secs must be >= 1");
    }
    if config.vector_store.upsert_batch_size == 0 {
        bail!("vector_store.upsert_batch_size must be >= 1");
    }
    if config.ingest.workers == 0 || config.ingest.embed_workers == 0 {
        bail!("ingest.workers and ingest.embed_workers must be >= 1");
    }
    if config.ingest.collection.trim().is_empty() {
        bail!("ingest.collection must not be empty");
    }
    if !(config.tuning.drift_threshold >= 0.0) {
        bail!("tuning.drift_threshold must be >= 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "gemini" | "openai" | "hash" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be gemini, openai, hash, or disabled.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0 when set");
    }

    match config.vector_store.backend.as_str() {
        "qdrant" | "sqlite" | "memory" => {}
        other => bail!(
            "Unknown vector store backend: '{}'. Must be qdrant, sqlite, or memory.",
            other
        ),
    }

    Ok(())
}
