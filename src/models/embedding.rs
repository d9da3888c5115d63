//! Batched embedding client (OpenAI-compatible `/embeddings`).

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::stats::CallStatsRegistry;
use crate::config::EmbeddingConfig;
use crate::types::{Result, RuntimeError};

/// Seam for components that embed text; lets tests run without a provider.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed `texts`, returning one vector per input in the same order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;
}

/// HTTP embedding client with batching and dimension validation.
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
    max_retries: u32,
    retry_delay: Duration,
    stats: Arc<CallStatsRegistry>,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig, stats: Arc<CallStatsRegistry>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RuntimeError::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            stats,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dimensions,
        });

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Upstream(format!(
                "embedding API error ({status}): {error_text}"
            )));
        }

        let json: Value = response.json().await.map_err(|e| {
            RuntimeError::Upstream(format!("failed to parse embedding response: {e}"))
        })?;

        let data = json
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| RuntimeError::Upstream("missing 'data' in embedding response".into()))?;

        // Sort by index so the output order matches the input order.
        let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
        for item in data {
            let index = item.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let vector = item
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    RuntimeError::Upstream("missing 'embedding' in response item".into())
                })?
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Option<Vec<f32>>>()
                .ok_or_else(|| RuntimeError::Upstream("invalid float in embedding".into()))?;
            indexed.push((index, vector));
        }
        indexed.sort_by_key(|(i, _)| *i);

        let vectors: Vec<Vec<f32>> = indexed.into_iter().map(|(_, v)| v).collect();

        if let Some(first) = vectors.first() {
            if first.len() != self.dimensions {
                tracing::warn!(
                    expected = self.dimensions,
                    got = first.len(),
                    model = %self.model,
                    "embedding dimension mismatch"
                );
            }
        }

        self.stats.record_embedding(&self.model, texts.len() as u64);
        Ok(vectors)
    }

    async fn embed_batch_with_retries(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match self.embed_batch(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    tracing::error!(attempt, error = %e, "embedding call failed");
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RuntimeError::Upstream("embedding call failed".into())))
    }
}

#[async_trait]
impl EmbeddingProvider for EmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.embed_batch_with_retries(batch).await?;
            all.extend(vectors);
        }
        Ok(all)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic hash-based embeddings for tests and offline runs.
pub struct MockEmbeddingProvider {
    dimensions: usize,
}

impl MockEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for (i, b) in text.bytes().enumerate() {
            let idx = (i + b as usize) % self.dimensions.max(1);
            vector[idx] += b as f32 / 255.0;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embeddings_are_deterministic_and_ordered() {
        let provider = MockEmbeddingProvider::new(64);
        let texts = vec!["一句话".to_string(), "另一句".to_string()];
        let a = provider.embed(&texts).await.unwrap();
        let b = provider.embed(&texts).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
    }

    #[tokio::test]
    async fn mock_embeddings_are_normalised() {
        let provider = MockEmbeddingProvider::new(128);
        let out = provider.embed(&["hello world".to_string()]).await.unwrap();
        let magnitude: f32 = out[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn empty_input_returns_empty_output() {
        let provider = MockEmbeddingProvider::new(8);
        assert!(provider.embed(&[]).await.unwrap().is_empty());
    }
}
