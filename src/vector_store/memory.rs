//! In-memory [`VectorStore`] implementation for tests.
//!
//! Uses `HashMap`s behind `std::sync::RwLock` for thread safety.
//! Search is brute-force cosine similarity over all stored vectors.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{top_k, VectorStore};
use crate::embedding::cosine_similarity;
use crate::models::{Point, ScoredPoint};

struct Collection {
    dim: usize,
    points: HashMap<String, (Vec<f32>, serde_json::Value)>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids stored in `collection`, sorted. Empty if the collection is missing.
    pub fn ids(&self, collection: &str) -> Vec<String> {
        let Ok(guard) = self.collections.read() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = guard
            .get(collection)
            .map(|c| c.points.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Payload of one point, if present.
    pub fn payload(&self, collection: &str, id: &str) -> Option<serde_json::Value> {
        let guard = self.collections.read().ok()?;
        guard
            .get(collection)
            .and_then(|c| c.points.get(id))
            .map(|(_, payload)| payload.clone())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    fn backend(&self) -> &str {
        "memory"
    }

    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        self.write()?
            .entry(name.to_string())
            .or_insert_with(|| Collection {
                dim,
                points: HashMap::new(),
            });
        Ok(())
    }

    async fn recreate_collection(&self, name: &str, dim: usize) -> Result<()> {
        self.write()?.insert(
            name.to_string(),
            Collection {
                dim,
                points: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<()> {
        let mut guard = self.write()?;
        let Some(coll) = guard.get_mut(collection) else {
            bail!("collection not found: {}", collection);
        };
        if let Some(bad) = points.iter().find(|p| p.vector.len() != coll.dim) {
            bail!(
                "point {} has dimension {}, collection {} expects {}",
                bad.id,
                bad.vector.len(),
                collection,
                coll.dim
            );
        }
        for p in points {
            coll.points
                .insert(p.id.clone(), (p.vector.clone(), p.payload.clone()));
        }
        Ok(())
    }

    async fn search(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredPoint>> {
        let guard = self.read()?;
        let Some(coll) = guard.get(collection) else {
            bail!("collection not found: {}", collection);
        };
        let hits = coll
            .points
            .iter()
            .map(|(id, (v, payload))| ScoredPoint {
                id: id.clone(),
                score: cosine_similarity(vector, v),
                payload: payload.clone(),
            })
            .collect();
        Ok(top_k(hits, k))
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let guard = self.read()?;
        Ok(guard
            .get(collection)
            .map(|c| c.points.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(id: &str, v: Vec<f32>) -> Point {
        Point {
            id: id.to_string(),
            vector: v,
            payload: json!({ "id": id }),
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_and_search_orders() {
        let store = InMemoryStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert(
                "c",
                &[
                    point("a", vec![1.0, 0.0]),
                    point("b", vec![0.0, 1.0]),
                    point("c", vec![0.7, 0.7]),
                ],
            )
            .await
            .unwrap();
        store.upsert("c", &[point("a", vec![1.0, 0.1])]).await.unwrap();
        assert_eq!(store.count("c").await.unwrap(), 3);

        let hits = store.search("c", &[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "c");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn ensure_is_idempotent_recreate_clears() {
        let store = InMemoryStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store.upsert("c", &[point("a", vec![1.0, 0.0])]).await.unwrap();
        store.ensure_collection("c", 3).await.unwrap();
        assert_eq!(store.count("c").await.unwrap(), 1);

        store.recreate_collection("c", 3).await.unwrap();
        assert_eq!(store.count("c").await.unwrap(), 0);
        assert!(store.upsert("c", &[point("a", vec![1.0, 0.0])]).await.is_err());
    }

    #[tokio::test]
    async fn upsert_into_missing_collection_fails() {
        let store = InMemoryStore::new();
        assert!(store.upsert("nope", &[point("a", vec![1.0])]).await.is_err());
    }
}
