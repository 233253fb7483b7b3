//! Retrying, validating wrapper around an [`EmbeddingProvider`].
//!
//! The provider makes one service call; the [`Embedder`] decides whether
//! to make another. Per batch:
//!
//! - every call is bounded by `call_timeout`;
//! - the response must contain one vector per input, each `dims()` long,
//!   otherwise it counts as a malformed (retryable) response;
//! - retryable errors are retried up to `max_retries` times, sleeping
//!   `backoff × retry_number` before each retry;
//! - non-retryable errors return immediately;
//! - wall-clock latency of the whole batch, retries included, is reported
//!   to the metrics sink whatever the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::EmbeddingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::EmbedError;
use crate::metrics::{emit_latency, MetricsSink, NoMetrics};

pub const METRICS_STREAM: &str = "embed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Linear backoff unit.
    pub backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
            call_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(retry)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EmbeddingConfig::default())
    }
}

#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    policy: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, policy: RetryPolicy) -> Self {
        Self {
            provider,
            policy,
            metrics: Arc::new(NoMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Embed `texts`, returning vectors in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let start = Instant::now();
        let (result, attempts) = self.embed_with_retries(texts).await;

        let (status, error) = match &result {
            Ok(_) => ("ok", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        let mut fields = json!({
            "size": texts.len(),
            "attempts": attempts,
            "status": status,
            "model": self.provider.model_name(),
        });
        if let Some(error) = error {
            fields["error"] = json!(error);
        }
        emit_latency(
            self.metrics.as_ref(),
            METRICS_STREAM,
            "embed_batch",
            start.elapsed(),
            fields,
        );

        result
    }

    async fn embed_with_retries(
        &self,
        texts: &[String],
    ) -> (Result<Vec<Vec<f32>>, EmbedError>, u32) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.call_once(texts).await {
                Ok(vectors) => return (Ok(vectors), attempt),
                Err(e) => e,
            };

            if !err.is_retryable() {
                return (Err(err), attempt);
            }
            let retry = attempt;
            if retry > self.policy.max_retries {
                let exhausted = EmbedError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                };
                return (Err(exhausted), attempt);
            }

            let delay = self.policy.delay_for(retry);
            tracing::warn!(
                attempt,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "embedding call failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn call_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let vectors =
            match tokio::time::timeout(self.policy.call_timeout, self.provider.embed_batch(texts))
                .await
            {
                Ok(result) => result?,
                Err(_) => return Err(EmbedError::Timeout(self.policy.call_timeout)),
            };

        if vectors.len() != texts.len() {
            return Err(EmbedError::MalformedResponse(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        let dims = self.provider.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(EmbedError::MalformedResponse(format!(
                "expected {} dimensions, got {}",
                dims,
                bad.len()
            )));
        }
        Ok(vectors)
    }
}
