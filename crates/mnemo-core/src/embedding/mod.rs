//! Embedding providers
//!
//! Provider-agnostic text-to-vector batch clients. Providers never throw
//! into callers: failures produce empty vectors for the affected items and
//! a log line, and the index layer skips them.

mod google;
mod openai;

pub use google::GoogleEmbedder;
pub use openai::OpenAiEmbedder;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Providers batch at most this many texts per upstream call.
pub const MAX_EMBED_BATCH: usize = 100;

/// A text-to-vector batch client.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn provider_name(&self) -> &str;
    fn model_name(&self) -> &str;
    fn dimension(&self) -> usize;

    /// Embed a batch of texts. One vector per input; failed items come
    /// back as empty vectors, never as errors.
    async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>>;
}

/// Which provider shape to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingKind {
    OpenAi,
    Google,
}

/// Direct API keys persisted in the data directory (0o600 on Unix).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyStore {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_api_key: Option<String>,
}

impl KeyStore {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("keys.json")
    }

    pub fn load(data_dir: &Path) -> Self {
        let path = Self::path(data_dir);
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Key store unreadable, ignoring: {}", e);
                Self::default()
            }),
            Err(e) => {
                warn!("Key store unreadable, ignoring: {}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, data_dir: &Path) -> std::io::Result<()> {
        let path = Self::path(data_dir);
        fs::create_dir_all(data_dir)?;
        let body = serde_json::to_vec_pretty(self)?;
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.write_all(&body)?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&path, body)?;
        }
        Ok(())
    }

    fn key_for(&self, kind: EmbeddingKind) -> Option<&str> {
        match kind {
            EmbeddingKind::OpenAi => self.openai_api_key.as_deref(),
            EmbeddingKind::Google => self.google_api_key.as_deref(),
        }
    }
}

/// Builds an embedding provider from the environment, scoped to one data
/// directory. Probes, in order: a proxy endpoint, direct keys from the
/// key store, then environment variables. Returns `None` when nothing is
/// available.
pub struct EmbeddingFactory {
    data_dir: PathBuf,
}

impl EmbeddingFactory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn create(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        let kind = match std::env::var("MNEMO_EMBEDDING_PROVIDER").as_deref() {
            Ok("google") => EmbeddingKind::Google,
            _ => EmbeddingKind::OpenAi,
        };
        let model = std::env::var("MNEMO_EMBEDDING_MODEL").ok();

        // 1. proxy endpoint: no key required
        if let Ok(proxy_url) = std::env::var("MNEMO_EMBEDDING_PROXY_URL") {
            info!("Using embedding proxy at {}", proxy_url);
            return Some(self.build(kind, &proxy_url, "", model.as_deref()));
        }

        // 2. direct keys from secure storage
        let keys = KeyStore::load(&self.data_dir);
        if let Some(key) = keys.key_for(kind) {
            return Some(self.build(kind, &default_api_url(kind), key, model.as_deref()));
        }

        // 3. environment variables
        let env_key = match kind {
            EmbeddingKind::OpenAi => std::env::var("OPENAI_API_KEY").ok(),
            EmbeddingKind::Google => std::env::var("GEMINI_API_KEY").ok(),
        };
        if let Some(key) = env_key {
            return Some(self.build(kind, &default_api_url(kind), &key, model.as_deref()));
        }

        warn!("No embedding provider available (no proxy, stored key or env key)");
        None
    }

    fn build(
        &self,
        kind: EmbeddingKind,
        api_url: &str,
        api_key: &str,
        model: Option<&str>,
    ) -> Arc<dyn EmbeddingProvider> {
        match kind {
            EmbeddingKind::OpenAi => Arc::new(OpenAiEmbedder::new(
                api_url,
                api_key,
                model.unwrap_or(openai::DEFAULT_MODEL),
            )),
            EmbeddingKind::Google => Arc::new(GoogleEmbedder::new(
                api_url,
                api_key,
                model.unwrap_or(google::DEFAULT_MODEL),
            )),
        }
    }
}

fn default_api_url(kind: EmbeddingKind) -> String {
    match kind {
        EmbeddingKind::OpenAi => "https://api.openai.com/v1".to_string(),
        EmbeddingKind::Google => "https://generativelanguage.googleapis.com".to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Deterministic embedder for tests: hashes words into a small vector
    /// so related texts score closer than unrelated ones.
    pub struct HashEmbedder {
        pub provider: String,
        pub model: String,
        pub dimension: usize,
    }

    impl HashEmbedder {
        pub fn new(provider: &str, model: &str) -> Self {
            Self {
                provider: provider.to_string(),
                model: model.to_string(),
                dimension: 16,
            }
        }

        fn embed_one(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; self.dimension];
            for word in text.split_whitespace() {
                let mut h: u32 = 2166136261;
                for b in word.bytes() {
                    h ^= b as u32;
                    h = h.wrapping_mul(16777619);
                }
                v[(h as usize) % self.dimension] += 1.0;
            }
            v
        }
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for HashEmbedder {
        fn provider_name(&self) -> &str {
            &self.provider
        }

        fn model_name(&self) -> &str {
            &self.model
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
            texts.iter().map(|t| self.embed_one(t)).collect()
        }
    }

    /// Embedder that always fails, returning empty vectors.
    pub struct BrokenEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        fn provider_name(&self) -> &str {
            "broken"
        }

        fn model_name(&self) -> &str {
            "broken"
        }

        fn dimension(&self) -> usize {
            16
        }

        async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
            texts.iter().map(|_| Vec::new()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore {
            openai_api_key: Some("sk-test".to_string()),
            google_api_key: None,
        };
        keys.save(dir.path()).unwrap();

        let loaded = KeyStore::load(dir.path());
        assert_eq!(loaded.openai_api_key.as_deref(), Some("sk-test"));
        assert!(loaded.google_api_key.is_none());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(KeyStore::path(dir.path()))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_key_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyStore::load(dir.path());
        assert!(keys.openai_api_key.is_none());
    }
}
