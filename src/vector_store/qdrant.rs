//! Qdrant backend over the REST API.
//!
//! Endpoints used:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | exists | `GET /collections/{name}` |
//! | create | `PUT /collections/{name}` with `{"vectors":{"size":d,"distance":"Cosine"}}` |
//! | drop | `DELETE /collections/{name}` |
//! | upsert | `PUT /collections/{name}/points?wait=true` |
//! | search | `POST /collections/{name}/points/search` |
//! | count | `POST /collections/{name}/points/count` with `{"exact":true}` |
//!
//! The URL comes from `vector_store.url`, then `QDRANT_URL`, then
//! `http://localhost:6333`. An API key, if set in the configured
//! environment variable, is sent as the `api-key` header.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use super::VectorStore;
use crate::config::VectorStoreConfig;
use crate::models::{Point, ScoredPoint};

const DEFAULT_URL: &str = "http://localhost:6333";

pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
}

impl QdrantStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .or_else(|| std::env::var("QDRANT_URL").ok())
            .unwrap_or_else(|| DEFAULT_URL.to_string());
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());

        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            headers.insert(
                HeaderName::from_static("api-key"),
                HeaderValue::from_str(&key).context("invalid Qdrant API key")?,
            );
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: url.trim_end_matches('/').to_string(),
        })
    }

    /// `{base}/collections/{name}/{tail..}` with every segment percent-encoded.
    fn collection_url(&self, name: &str, tail: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid Qdrant URL: {}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Qdrant URL cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .push("collections")
            .push(name)
            .extend(tail);
        Ok(url)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let response = self
            .http
            .get(self.collection_url(name, &[])?)
            .send()
            .await
            .with_context(|| format!("Qdrant unreachable at {}", self.base_url))?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => bail!(
                "qdrant collection lookup failed ({}): {}",
                other,
                response.text().await.unwrap_or_default()
            ),
        }
    }

    async fn create(&self, name: &str, dim: usize) -> Result<()> {
        let body = json!({
            "vectors": {
                "size": dim,
                "distance": "Cosine"
            }
        });
        let response = self
            .http
            .put(self.collection_url(name, &[])?)
            .json(&body)
            .send()
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            other => bail!(
                "qdrant collection error ({}): {}",
                other,
                response.text().await.unwrap_or_default()
            ),
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<SearchEntry>,
}

#[derive(Deserialize)]
struct SearchEntry {
    id: serde_json::Value,
    score: f32,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CountResponse {
    result: CountResult,
}

#[derive(Deserialize)]
struct CountResult {
    count: u64,
}

/// Qdrant ids are UUID strings or unsigned integers.
fn id_to_string(id: serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn backend(&self) -> &str {
        "qdrant"
    }

    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        if self.exists(name).await? {
            tracing::debug!(collection = name, "qdrant collection exists");
            return Ok(());
        }
        tracing::info!(collection = name, dim, "creating qdrant collection");
        self.create(name, dim).await
    }

    async fn recreate_collection(&self, name: &str, dim: usize) -> Result<()> {
        let response = self
            .http
            .delete(self.collection_url(name, &[])?)
            .send()
            .await
            .with_context(|| format!("Qdrant unreachable at {}", self.base_url))?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            bail!(
                "qdrant collection delete failed ({}): {}",
                status,
                response.text().await.unwrap_or_default()
            );
        }
        tracing::info!(collection = name, dim, "recreating qdrant collection");
        self.create(name, dim).await
    }

    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let body = json!({
            "points": points
                .iter()
                .map(|p| json!({ "id": p.id, "vector": p.vector, "payload": p.payload }))
                .collect::<Vec<_>>()
        });
        let response = self
            .http
            .put(self.collection_url(collection, &["points"])?)
            .query(&[("wait", "true")])
            .json(&body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            bail!(
                "qdrant upsert failed ({}): {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }
    }

    async fn search(&self, collection: &str, vector: &[f32], k: usize) -> Result<Vec<ScoredPoint>> {
        let body = json!({
            "vector": vector,
            "limit": k,
            "with_payload": true,
        });
        let response = self
            .http
            .post(self.collection_url(collection, &["points", "search"])?)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!(
                "qdrant search failed ({}): {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }
        let parsed: SearchResponse = response.json().await?;
        // Qdrant already returns best-first.
        Ok(parsed
            .result
            .into_iter()
            .map(|e| ScoredPoint {
                id: id_to_string(e.id),
                score: e.score,
                payload: e.payload.unwrap_or(serde_json::Value::Null),
            })
            .collect())
    }

    async fn count(&self, collection: &str) -> Result<u64> {
        let response = self
            .http
            .post(self.collection_url(collection, &["points", "count"])?)
            .json(&json!({ "exact": true }))
            .send()
            .await?;
        if !response.status().is_success() {
            bail!(
                "qdrant count failed ({}): {}",
                response.status(),
                response.text().await.unwrap_or_default()
            );
        }
        let parsed: CountResponse = response.json().await?;
        Ok(parsed.result.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_become_strings() {
        assert_eq!(id_to_string(json!("5f0c")), "5f0c");
        assert_eq!(id_to_string(json!(42)), "42");
    }

    #[test]
    fn parses_search_response() {
        let parsed: SearchResponse = serde_json::from_str(
            r#"{"result":[{"id":"a","version":3,"score":0.9,"payload":{"rel_path":"x.md"}},
                          {"id":7,"version":1,"score":0.5}],"status":"ok","time":0.001}"#,
        )
        .unwrap();
        assert_eq!(parsed.result.len(), 2);
        assert!(parsed.result[1].payload.is_none());
    }

    #[test]
    fn url_prefers_config_then_env() {
        let config = VectorStoreConfig {
            url: Some("http://qdrant.internal:6333/".to_string()),
            ..VectorStoreConfig::default()
        };
        let store = QdrantStore::new(&config).unwrap();
        assert_eq!(store.base_url, "http://qdrant.internal:6333");
        assert_eq!(
            store.collection_url("lib", &[]).unwrap().as_str(),
            "http://qdrant.internal:6333/collections/lib"
        );
    }

    #[test]
    fn collection_names_are_encoded_as_one_segment() {
        let config = VectorStoreConfig {
            url: Some("http://localhost:6333/qdrant".to_string()),
            ..VectorStoreConfig::default()
        };
        let store = QdrantStore::new(&config).unwrap();
        let url = store
            .collection_url("my lib/../v2?x", &["points", "search"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:6333/qdrant/collections/my%20lib%2F..%2Fv2%3Fx/points/search"
        );
        assert_eq!(url.query(), None);
    }
}
