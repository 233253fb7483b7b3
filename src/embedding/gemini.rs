//! Google Gemini embeddings via `models/{model}:batchEmbedContents`.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use super::{api_key, error_from_response, http_client, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::EmbedError;

pub const DEFAULT_MODEL: &str = "gemini-embedding-001";
pub const DEFAULT_DIMS: usize = 3072;
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Embedding provider backed by the Gemini API.
///
/// Requires `GOOGLE_API_KEY` (or the variable named by
/// `embedding.api_key_env`). The model defaults to `GEMINI_EMBED_MODEL`,
/// then `gemini-embedding-001`.
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = api_key(config, "GOOGLE_API_KEY")?;
        let model = config
            .model
            .clone()
            .or_else(|| std::env::var("GEMINI_EMBED_MODEL").ok())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client: http_client()?,
            base_url,
            model,
            dims: config.dims.unwrap_or(DEFAULT_DIMS),
            api_key,
        })
    }
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Deserialize)]
struct ContentEmbedding {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let model_ref = format!("models/{}", self.model);
        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| {
                serde_json::json!({
                    "model": model_ref,
                    "content": { "parts": [{ "text": t }] },
                    "outputDimensionality": self.dims,
                })
            })
            .collect();

        let url = format!(
            "{}/v1beta/models/{}:batchEmbedContents",
            self.base_url, self.model
        );
        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: BatchResponse = response.json().await?;
        Ok(body.embeddings.into_iter().map(|e| e.values).collect())
    }
}
