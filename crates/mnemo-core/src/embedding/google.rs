//! Google-shaped embedding provider
//!
//! POST `{api_url}/v1beta/models/{model}:batchEmbedContents` with the key
//! as a query parameter.

use tracing::warn;

use super::{EmbeddingProvider, MAX_EMBED_BATCH};

pub const DEFAULT_MODEL: &str = "text-embedding-004";
pub const DEFAULT_DIMENSION: usize = 768;

pub struct GoogleEmbedder {
    api_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl GoogleEmbedder {
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

        let requests: Vec<serde_json::Value> = texts
            .iter()
            .map(|text| {
                serde_json::json!({
                    "model": format!("models/{}", self.model),
                    "content": { "parts": [{ "text": text }] }
                })
            })
            .collect();

        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:batchEmbedContents?key={}",
                self.api_url, self.model, self.api_key
            ))
            .json(&serde_json::json!({ "requests": requests }))
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

        let Some(embeddings) = json["embeddings"].as_array() else {
            warn!("Embedding response missing embeddings array");
            return empty();
        };

        let vectors: Vec<Vec<f32>> = embeddings
            .iter()
            .map(|item| {
                item["values"]
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
impl EmbeddingProvider for GoogleEmbedder {
    fn provider_name(&self) -> &str {
        "google"
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
