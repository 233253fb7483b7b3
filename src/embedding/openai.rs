//! OpenAI embeddings via `POST /v1/embeddings`.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

use super::{api_key, error_from_response, http_client, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::EmbedError;

const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Embedding provider using the OpenAI API.
///
/// Requires `OPENAI_API_KEY` (or the variable named by
/// `embedding.api_key_env`).
pub struct OpenAIProvider {
    client: reqwest::Client,
    base_url: String,
    /// Model name (e.g. `"text-embedding-3-small"`).
    model: String,
    /// Vector dimensionality (e.g. `1536`).
    dims: usize,
    api_key: String,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the API key is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = api_key(config, "OPENAI_API_KEY")?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let dims = config.dims.unwrap_or(match model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        });
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
            dims,
            api_key,
        })
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

/// Restore input order; the API does not promise to keep it.
fn into_input_order(mut data: Vec<EmbeddingItem>) -> Vec<Vec<f32>> {
    data.sort_by_key(|item| item.index);
    data.into_iter().map(|item| item.embedding).collect()
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        if self.model.starts_with("text-embedding-3") {
            body["dimensions"] = serde_json::json!(self.dims);
        }

        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: EmbeddingsResponse = response.json().await?;
        Ok(into_input_order(parsed.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorders_by_index() {
        let parsed: EmbeddingsResponse = serde_json::from_str(
            r#"{"data":[
                {"index":1,"embedding":[0.0,1.0]},
                {"index":0,"embedding":[1.0,0.0]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(
            into_input_order(parsed.data),
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        );
    }
}
