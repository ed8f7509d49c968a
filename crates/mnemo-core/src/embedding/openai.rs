//! OpenAI-shaped embedding provider
//!
//! POST `{api_url}/embeddings` with a bearer token. Also covers proxies
//! and self-hosted servers speaking the same shape.

use tracing::warn;

use super::{EmbeddingProvider, MAX_EMBED_BATCH};

pub const DEFAULT_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_DIMENSION: usize = 1536;

pub struct OpenAiEmbedder {
    api_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(api_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension: DEFAULT_DIMENSION,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    async fn embed_chunk(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let empty = || texts.iter().map(|_| Vec::new()).collect::<Vec<_>>();

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": &self.model,
                "input": texts,
                "encoding_format": "float"
            }))
            .send()
            .await;

        let resp = match response {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!("Embedding API returned status {}", resp.status());
                return empty();
            }
            Err(e) => {
                warn!("Embedding request failed: {}", e);
                return empty();
            }
        };

        let json: serde_json::Value = match resp.json().await {
            Ok(json) => json,
            Err(e) => {
                warn!("Embedding response unreadable: {}", e);
                return empty();
            }
        };

        let Some(data) = json["data"].as_array() else {
            warn!("Embedding response missing data array");
            return empty();
        };

        let vectors: Vec<Vec<f32>> = data
            .iter()
            .map(|item| {
                item["embedding"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        if vectors.len() != texts.len() {
            warn!(
                "Embedding count mismatch: {} returned for {} inputs",
                vectors.len(),
                texts.len()
            );
            return empty();
        }
        vectors
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_EMBED_BATCH) {
            out.extend(self.embed_chunk(chunk).await);
        }
        out
    }
}
