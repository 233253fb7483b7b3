//! SQLite backend.
//!
//! Two tables:
//!
//! ```sql
//! collections(name TEXT PRIMARY KEY, dims INTEGER, created_at INTEGER)
//! points(collection TEXT, id TEXT, vector BLOB, payload_json TEXT, updated_at INTEGER,
//!        PRIMARY KEY (collection, id))
//! ```
//!
//! Vectors are little-endian `f32` BLOBs ([`vec_to_blob`]). Search loads
//! every vector of the collection and ranks by cosine similarity, which is
//! fine for the corpus sizes a single-file store is meant for.

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{top_k, VectorStore};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Point, ScoredPoint};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn connect(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open vector database: {}", path.display()))?;

        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn collection_dims(&self, name: &str) -> Result<Option<usize>> {
        let row = sqlx::query("SELECT dims FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("dims") as usize))
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS points (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            vector BLOB NOT NULL,
            payload_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[async_trait]
impl VectorStore for SqliteStore {
    fn backend(&self) -> &str {
        "sqlite"
    }

    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        if let Some(existing) = self.collection_dims(name).await? {
            if existing != dim {
                tracing::warn!(
                    collection = name,
                    existing,
                    requested = dim,
                    "collection exists with a different dimension"
                );
            }
            return Ok(());
        }
        sqlx::query("INSERT OR IGNORE INTO collections (name, dims, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(dim as i64)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recreate_collection(&self, name: &str, dim: usize) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM points WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO collections (name, dims, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(dim as i64)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<()> {
        let Some(dims) = self.collection_dims(collection).await? else {
            bail!("collection not found: {}", collection);
        };
        if let Some(bad) = points.iter().find(|p| p.vector.len() != dims) {
            bail!(
                "point {} has dimension {}, collection {} expects {}",
                bad.id,
                bad.vector.len(),
                collection,
                dims
            );
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for p in points {
            sqlx::query(
                r#"
                INSERT INTO points (collection, id, vector, payload_json, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    vector = excluded.vector,
                    payload_json = excluded.payload_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(collection)
            .bind(&p.id)
            .bind(vec_to_blob(&p.vector))
            .bind(serde_json::to_string(&p.payload)?)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredPoint>> {
        let rows = sqlx::query("SELECT id, vector, payload_json FROM points WHERE collection = ?")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                let payload_json: String = row.get("payload_json");
                ScoredPoint {
                    id: row.get("id"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                    payload: serde_json::from_str(&payload_json)
                        .unwrap_or(serde_json::Value::Null),
                }
            })
            .collect();
        Ok(top_k(hits, k))
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM points WHERE collection = ?")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn point(id: &str, v: Vec<f32>) -> Point {
        Point {
            id: id.to_string(),
            vector: v,
            payload: json!({ "rel_path": format!("{id}.md") }),
        }
    }

    #[tokio::test]
    async fn roundtrip_through_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sub/vectors.sqlite");
        let store = SqliteStore::connect(&path).await.unwrap();
        store.ensure_collection("lib", 3).await.unwrap();
        store
            .upsert(
                "lib",
                &[
                    point("a", vec![1.0, 0.0, 0.0]),
                    point("b", vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();
        store.upsert("lib", &[point("a", vec![0.9, 0.1, 0.0])]).await.unwrap();
        assert_eq!(store.count("lib").await.unwrap(), 2);
        drop(store);

        let store = SqliteStore::connect(&path).await.unwrap();
        let hits = store.search("lib", &[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[0].payload["rel_path"], "a.md");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn rejects_wrong_dimension_and_missing_collection() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::connect(&tmp.path().join("v.sqlite")).await.unwrap();
        assert!(store.upsert("none", &[point("a", vec![1.0])]).await.is_err());
        store.ensure_collection("lib", 2).await.unwrap();
        assert!(store.upsert("lib", &[point("a", vec![1.0])]).await.is_err());
    }

    #[tokio::test]
    async fn recreate_empties_collection() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::connect(&tmp.path().join("v.sqlite")).await.unwrap();
        store.ensure_collection("lib", 2).await.unwrap();
        store.upsert("lib", &[point("a", vec![1.0, 0.0])]).await.unwrap();
        store.recreate_collection("lib", 2).await.unwrap();
        assert_eq!(store.count("lib").await.unwrap(), 0);
    }
}
