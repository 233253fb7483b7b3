//! Nearest-neighbour search over an ingested collection.
//!
//! The query is embedded with the same provider and retry policy as
//! ingestion, then handed to [`VectorStore::search`]. Results are sorted by
//! descending score, ties by id so output is deterministic.

use anyhow::{Context, Result};

use crate::embedder::Embedder;
use crate::models::{ChunkPayload, ScoredPoint};
use crate::vector_store::VectorStore;

pub async fn search(
    embedder: &Embedder,
    store: &dyn VectorStore,
    collection: &str,
    query: &str,
    k: usize,
) -> Result<Vec<ScoredPoint>> {
    if query.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let mut vectors = embedder
        .embed(&[query.to_string()])
        .await
        .context("Failed to embed query")?;
    let Some(vector) = vectors.pop() else {
        return Ok(Vec::new());
    };

    let mut hits = store.search(collection, &vector, k).await?;
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k);
    Ok(hits)
}

/// Human-readable result list for `vfold search`.
pub fn format_results(hits: &[ScoredPoint]) -> String {
    if hits.is_empty() {
        return "No results.\n".to_string();
    }

    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        match serde_json::from_value::<ChunkPayload>(hit.payload.clone()) {
            Ok(payload) => {
                let title = payload.title.as_deref().unwrap_or("(untitled)");
                out.push_str(&format!(
                    "{}. [{:.3}] {} #{} / {}\n",
                    i + 1,
                    hit.score,
                    payload.rel_path,
                    payload.chunk_index,
                    title
                ));
                if let Some(author) = &payload.author {
                    out.push_str(&format!("    author: {}\n", author));
                }
                let excerpt: String = payload.text.chars().take(200).collect();
                out.push_str(&format!(
                    "    excerpt: \"{}\"\n",
                    excerpt.replace('\n', " ").trim()
                ));
            }
            Err(_) => {
                out.push_str(&format!("{}. [{:.3}] (no payload)\n", i + 1, hit.score));
            }
        }
        out.push_str(&format!("    id: {}\n\n", hit.id));
    }
    out
}
