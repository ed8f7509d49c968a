//! Page search index
//!
//! Flat cosine index over page summaries, persisted as a single JSON file.
//! The header records which embedding provider and model produced the
//! vectors; a mismatch on load discards every entry, since vectors from
//! different models are semantically incomparable.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embedding::EmbeddingProvider;
use crate::error::StoreResult;
use crate::memory::store::write_json_atomic;

pub const INDEX_VERSION: u32 = 1;

/// Candidates above this pairwise cosine are considered duplicates of an
/// already-kept result.
pub const DEDUP_COSINE: f32 = 0.9;

/// Weighted boost contribution cap applied on top of raw scores.
pub const BOOST_SCALE: f32 = 0.15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub embedding: Vec<f32>,
    pub label: String,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    provider: String,
    model: String,
    dimension: usize,
    updated_at: DateTime<Utc>,
    entries: HashMap<String, IndexEntry>,
}

/// A search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub page_id: String,
    pub label: String,
    pub score: f32,
}

/// An embedding that biases scoring toward recently referenced pages.
#[derive(Debug, Clone)]
pub struct RefBoost {
    pub embedding: Vec<f32>,
    pub weight: f32,
}

/// Cosine similarity with a zero-magnitude guard.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// In-memory cosine index over page summaries.
pub struct PageSearchIndex {
    path: PathBuf,
    embedder: Arc<dyn EmbeddingProvider>,
    entries: HashMap<String, IndexEntry>,
}

impl PageSearchIndex {
    pub fn new(path: impl Into<PathBuf>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            path: path.into(),
            embedder,
            entries: HashMap::new(),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.path
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.embedder)
    }

    /// Swap the persistence destination (used after an atomic rename).
    pub fn set_index_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Load the persisted file. Provider or model drift discards every
    /// entry; backfill repopulates later.
    pub fn load(&mut self) -> StoreResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&self.path)?;
        let file: IndexFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!("Search index unreadable, starting empty: {}", e);
                return Ok(());
            }
        };

        if file.provider != self.embedder.provider_name()
            || file.model != self.embedder.model_name()
        {
            info!(
                "Embedding model drift ({}/{} -> {}/{}), discarding {} index entries",
                file.provider,
                file.model,
                self.embedder.provider_name(),
                self.embedder.model_name(),
                file.entries.len()
            );
            self.entries.clear();
            return Ok(());
        }

        self.entries = file.entries;
        debug!("Loaded search index with {} entries", self.entries.len());
        Ok(())
    }

    pub fn save(&self) -> StoreResult<()> {
        let file = IndexFile {
            version: INDEX_VERSION,
            provider: self.embedder.provider_name().to_string(),
            model: self.embedder.model_name().to_string(),
            dimension: self.embedder.dimension(),
            updated_at: Utc::now(),
            entries: self.entries.clone(),
        };
        write_json_atomic(&self.path, &file)
    }

    /// Embed `text` and store it under `id`. Returns false when the
    /// embedding came back empty (provider failure).
    pub async fn index_page(&mut self, id: &str, text: &str, label: &str) -> bool {
        let vectors = self.embedder.embed(&[text.to_string()]).await;
        match vectors.into_iter().next() {
            Some(embedding) if !embedding.is_empty() => {
                self.entries.insert(
                    id.to_string(),
                    IndexEntry {
                        embedding,
                        label: label.to_string(),
                    },
                );
                true
            }
            _ => {
                warn!("Empty embedding for page {}, not indexed", id);
                false
            }
        }
    }

    /// Batch variant of [`index_page`]; returns how many entries landed.
    pub async fn index_pages(&mut self, items: &[(String, String, String)]) -> usize {
        if items.is_empty() {
            return 0;
        }
        let texts: Vec<String> = items.iter().map(|(_, text, _)| text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await;

        let mut indexed = 0;
        for ((id, _, label), embedding) in items.iter().zip(vectors) {
            if embedding.is_empty() {
                warn!("Empty embedding for page {}, not indexed", id);
                continue;
            }
            self.entries.insert(
                id.clone(),
                IndexEntry {
                    embedding,
                    label: label.clone(),
                },
            );
            indexed += 1;
        }
        indexed
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Insert a pre-computed embedding (shadow rebuilds reuse vectors).
    pub fn insert_embedding(&mut self, id: &str, embedding: Vec<f32>, label: &str) {
        self.entries.insert(
            id.to_string(),
            IndexEntry {
                embedding,
                label: label.to_string(),
            },
        );
    }

    pub fn entry(&self, id: &str) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    /// Cosine search: score all entries, keep those at or above
    /// `threshold`, deduplicate near-identical results, return the top
    /// `k`.
    pub async fn search(&self, query: &str, k: usize, threshold: f32) -> Vec<SearchHit> {
        let vectors = self.embedder.embed(&[query.to_string()]).await;
        let Some(query_vec) = vectors.into_iter().next().filter(|v| !v.is_empty()) else {
            warn!("Query embedding unavailable, returning no results");
            return Vec::new();
        };
        self.rank(&query_vec, k, threshold, &[])
    }

    /// Search with ref boosts: each boost adds
    /// `max(cos(entry, boost) * weight) * 0.15` to the raw score. The
    /// threshold filters on the raw score only, so boosts reorder results
    /// but cannot manufacture relevance.
    pub async fn search_with_ref_boosts(
        &self,
        query: &str,
        k: usize,
        threshold: f32,
        boosts: &[RefBoost],
    ) -> Vec<SearchHit> {
        let vectors = self.embedder.embed(&[query.to_string()]).await;
        let Some(query_vec) = vectors.into_iter().next().filter(|v| !v.is_empty()) else {
            warn!("Query embedding unavailable, returning no results");
            return Vec::new();
        };
        self.rank(&query_vec, k, threshold, boosts)
    }

    fn rank(
        &self,
        query_vec: &[f32],
        k: usize,
        threshold: f32,
        boosts: &[RefBoost],
    ) -> Vec<SearchHit> {
        let mut scored: Vec<(&String, &IndexEntry, f32)> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                let raw = cosine(query_vec, &entry.embedding);
                if raw < threshold {
                    return None;
                }
                let boost = boosts
                    .iter()
                    .map(|b| cosine(&entry.embedding, &b.embedding) * b.weight)
                    .fold(0.0f32, f32::max);
                Some((id, entry, raw + boost * BOOST_SCALE))
            })
            .collect();

        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(2 * k);

        // Inter-result deduplication: keep a candidate only if it is not
        // a near-duplicate of anything already kept.
        let mut kept: Vec<(&String, &IndexEntry, f32)> = Vec::new();
        for candidate in scored {
            let duplicate = kept
                .iter()
                .any(|(_, entry, _)| cosine(&candidate.1.embedding, &entry.embedding) > DEDUP_COSINE);
            if !duplicate {
                kept.push(candidate);
            }
            if kept.len() == k {
                break;
            }
        }

        kept.into_iter()
            .map(|(id, entry, score)| SearchHit {
                page_id: id.clone(),
                label: entry.label.clone(),
                score,
            })
            .collect()
    }

    /// Deep copy, optionally re-homed at `new_path`; used as the shadow
    /// index during batch rebuilds.
    pub fn clone_at(&self, new_path: Option<PathBuf>) -> Self {
        Self {
            path: new_path.unwrap_or_else(|| self.path.clone()),
            embedder: Arc::clone(&self.embedder),
            entries: self.entries.clone(),
        }
    }
}
