//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the only thing the pipeline knows about
//! where vectors end up. Backends:
//!
//! | Config value | Backend |
//! |--------------|---------|
//! | `"qdrant"` | [`QdrantStore`]: Qdrant REST API |
//! | `"sqlite"` | [`SqliteStore`]: local file, brute-force cosine search |
//! | `"memory"` | [`InMemoryStore`]: process-local, for tests |
//!
//! Point ids are chunk UUIDs, so upserting the same chunk twice overwrites
//! it instead of duplicating it.

pub mod memory;
pub mod qdrant;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use qdrant::QdrantStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::VectorStoreConfig;
use crate::models::{Point, ScoredPoint};

/// Abstract vector index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_collection`](VectorStore::ensure_collection) | Create the collection if missing |
/// | [`recreate_collection`](VectorStore::recreate_collection) | Drop and create |
/// | [`upsert`](VectorStore::upsert) | Insert or overwrite points by id |
/// | [`search`](VectorStore::search) | Top-k by cosine similarity, best first |
/// | [`count`](VectorStore::count) | Number of points |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend name for logs and reports.
    fn backend(&self) -> &str;

    /// Create `name` with dimension `dim` unless it exists. An existing
    /// collection is left as is, even if its dimension differs.
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()>;

    /// Drop `name` with all its points, then create it empty.
    async fn recreate_collection(&self, name: &str, dim: usize) -> Result<()>;

    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<()>;

    /// Nearest `k` points, sorted by descending score.
    async fn search(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredPoint>>;

    async fn count(&self, collection: &str) -> Result<u64>;
}

/// Build the configured backend. Connects eagerly so an unreachable
/// store fails here rather than mid-run.
pub async fn create_store(config: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.backend.as_str() {
        "qdrant" => Ok(Arc::new(QdrantStore::new(config)?)),
        "sqlite" => Ok(Arc::new(SqliteStore::connect(&config.path).await?)),
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        other => bail!("Unknown vector store backend: {}", other),
    }
}

/// Sort hits best-first and keep `k`.
pub(crate) fn top_k(mut hits: Vec<ScoredPoint>, k: usize) -> Vec<ScoredPoint> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(k);
    hits
}
