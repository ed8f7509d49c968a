//! Semantic retrieval
//!
//! Orchestrates the page search index against one VirtualMemory: auto-fill
//! before each turn (inline ref harvest + semantic fill), explicit
//! queries, live indexing of new pages, and startup backfill.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::embedding::EmbeddingProvider;
use crate::index::{PageSearchIndex, SearchHit};
use crate::markers::harvest_refs;
use crate::memory::message::{Message, MessageRole};
use crate::memory::store::PageStore;
use crate::memory::virtual_memory::VirtualMemory;

/// Messages hashed for auto-fill change detection.
const CHANGE_WINDOW: usize = 6;

/// Queries shorter than this are padded with the latest assistant
/// message.
const MIN_QUERY_CHARS: usize = 20;

/// Orchestrator bound to one VirtualMemory and one PageSearchIndex.
pub struct SemanticRetrieval {
    index: PageSearchIndex,
    max_auto_fill_pages: usize,
    fill_fraction: f32,
    threshold: f32,
    last_fill_hash: Option<u64>,
    batch_running: bool,
}

impl SemanticRetrieval {
    pub fn new(index: PageSearchIndex, config: &MemoryConfig) -> Self {
        Self {
            index,
            max_auto_fill_pages: config.max_auto_fill_pages,
            fill_fraction: config.auto_fill_budget_fraction,
            threshold: config.search_threshold,
            last_fill_hash: None,
            batch_running: false,
        }
    }

    pub fn index(&self) -> &PageSearchIndex {
        &self.index
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.index.embedder()
    }

    /// Whether a batch rebuild currently owns the index.
    pub fn is_batch_running(&self) -> bool {
        self.batch_running
    }

    pub(crate) fn set_batch_running(&mut self, running: bool) {
        self.batch_running = running;
    }

    /// Replace the live index. Synchronous: callers guarantee no query is
    /// in flight across this boundary.
    pub(crate) fn swap_index(&mut self, index: PageSearchIndex) {
        self.index = index;
    }

    /// Fill page slots before a turn: harvest inline refs from working
    /// memory, then semantically match the latest user message against
    /// the index. Returns the number of loads queued.
    pub async fn auto_fill_page_slots(
        &mut self,
        vm: &mut VirtualMemory,
        messages: &[Message],
    ) -> Result<usize> {
        // 1. change detection over the most recent messages
        let hash = change_hash(messages);
        if self.last_fill_hash == Some(hash) {
            debug!("Working window unchanged, skipping auto-fill");
            return Ok(0);
        }
        self.last_fill_hash = Some(hash);

        let slot_budget = vm.config().page_slot_tokens;
        let mut remaining = slot_budget.saturating_sub(vm.loaded_page_tokens());
        let mut queued = 0usize;

        // 2. inline harvest: explicit @@ref@@ markers win over semantics
        for message in messages {
            for id in harvest_refs(&message.content) {
                if vm.is_page_active(&id) || vm.unref_history().contains(&id) {
                    continue;
                }
                let Some(meta) = vm.store().meta(&id) else {
                    continue;
                };
                if meta.tokens > remaining {
                    debug!("Skipping inline ref {}: over page-slot budget", id);
                    continue;
                }
                remaining = remaining.saturating_sub(meta.tokens);
                vm.ref_page(&id);
                queued += 1;
            }
        }

        // 3. semantic fill from the latest user message
        let Some(query) = build_query(messages) else {
            return Ok(queued);
        };
        let fill_budget = (remaining as f32 * self.fill_fraction) as usize;
        let mut spent = 0usize;
        let mut filled = 0usize;

        let hits = self
            .index
            .search(&query, self.max_auto_fill_pages, self.threshold)
            .await;
        for hit in hits {
            if filled >= self.max_auto_fill_pages {
                break;
            }
            if vm.is_page_active(&hit.page_id) || vm.unref_history().contains(&hit.page_id) {
                continue;
            }
            let Some(meta_tokens) = vm.store().meta(&hit.page_id).map(|meta| meta.tokens) else {
                continue;
            };
            if spent + meta_tokens > fill_budget {
                continue;
            }
            spent += meta_tokens;
            vm.ref_page(&hit.page_id);
            filled += 1;
            queued += 1;
            debug!(
                "Auto-fill queued {} (score {:.2}, {} tokens)",
                hit.page_id, hit.score, meta_tokens
            );
        }

        Ok(queued)
    }

    /// Explicit query, triggered by the `@@ref('?query')@@` marker. Loads
    /// any unloaded results and returns the hits.
    pub async fn search(&mut self, query: &str, vm: &mut VirtualMemory) -> Result<Vec<SearchHit>> {
        let k = self.max_auto_fill_pages.max(5);
        let hits = self.index.search(query, k, self.threshold).await;
        for hit in &hits {
            if !vm.is_page_active(&hit.page_id) {
                vm.ref_page(&hit.page_id);
            }
        }
        info!("Explicit search '{}' matched {} pages", query, hits.len());
        Ok(hits)
    }

    /// Live indexing hook: embed a freshly created page's summary.
    pub async fn on_page_created(&mut self, id: &str, summary: &str, label: &str) -> Result<()> {
        if self.index.index_page(id, summary, label).await {
            self.index.save()?;
        }
        Ok(())
    }

    /// Drain pages created by recent eviction passes into the index.
    pub async fn index_new_pages(&mut self, vm: &mut VirtualMemory) -> Result<usize> {
        let new_pages = vm.drain_new_pages();
        let mut indexed = 0;
        for page in new_pages {
            self.on_page_created(&page.id, &page.summary, &page.label)
                .await?;
            indexed += 1;
        }
        Ok(indexed)
    }

    /// Startup backfill: embed every page whose summary exists but whose
    /// id is absent from the index. Pages without a summary are broken or
    /// incomplete and are skipped. Refuses to run during a batch rebuild.
    pub async fn backfill(&mut self, store: &PageStore) -> Result<usize> {
        if self.batch_running {
            warn!("Backfill refused: batch rebuild in progress");
            return Ok(0);
        }

        let mut items: Vec<(String, String, String)> = Vec::new();
        for meta in store.list() {
            if self.index.contains(&meta.id) {
                continue;
            }
            let page = match store.read(&meta.id) {
                Ok(page) => page,
                Err(e) => {
                    warn!("Backfill skipping unreadable page {}: {}", meta.id, e);
                    continue;
                }
            };
            if let Some(summary) = page.summary {
                items.push((page.id, summary, page.label));
            }
        }

        if items.is_empty() {
            return Ok(0);
        }
        let indexed = self.index.index_pages(&items).await;
        self.index.save()?;
        info!("Backfill indexed {} of {} candidate pages", indexed, items.len());
        Ok(indexed)
    }
}

/// Hash the last few messages for change detection.
fn change_hash(messages: &[Message]) -> u64 {
    let mut hasher = DefaultHasher::new();
    let start = messages.len().saturating_sub(CHANGE_WINDOW);
    for message in &messages[start..] {
        message.role.as_str().hash(&mut hasher);
        message.content.hash(&mut hasher);
    }
    hasher.finish()
}

/// Build the semantic-fill query: the most recent user message, padded
/// with the latest assistant message when too short to mean much.
fn build_query(messages: &[Message]) -> Option<String> {
    let user = messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User && !m.is_synthetic())?;
    let mut query = user.content.clone();
    if query.len() < MIN_QUERY_CHARS {
        if let Some(assistant) = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && !m.is_synthetic())
        {
            query.push(' ');
            query.push_str(&assistant.content);
        }
    }
    Some(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::driver::testing::FixedDriver;
    use crate::embedding::testing::HashEmbedder;

    fn setup(dir: &std::path::Path) -> (VirtualMemory, SemanticRetrieval) {
        let config = MemoryConfig::new(dir);
        let driver = Arc::new(FixedDriver::new("STATUS: ok\n- summary"));
        let vm = VirtualMemory::new(config.clone(), driver).unwrap();
        let index = PageSearchIndex::new(
            config.pages_dir().join("embeddings.json"),
            Arc::new(HashEmbedder::new("test", "m1")),
        );
        let retrieval = SemanticRetrieval::new(index, &config);
        (vm, retrieval)
    }

    #[test]
    fn test_change_hash_stable() {
        let messages = vec![Message::user("hello"), Message::assistant("hi")];
        assert_eq!(change_hash(&messages), change_hash(&messages));
        let other = vec![Message::user("hello"), Message::assistant("bye")];
        assert_ne!(change_hash(&messages), change_hash(&other));
    }

    #[test]
    fn test_query_padding() {
        let messages = vec![
            Message::assistant("we were discussing the paging engine design"),
            Message::user("and?"),
        ];
        let query = build_query(&messages).unwrap();
        assert!(query.contains("and?"));
        assert!(query.contains("paging engine"));

        let messages = vec![Message::user(
            "a long enough standalone question about lifetimes",
        )];
        let query = build_query(&messages).unwrap();
        assert_eq!(query, "a long enough standalone question about lifetimes");
    }

    #[tokio::test]
    async fn test_backfill_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (mut vm, mut retrieval) = setup(dir.path());

        // Force some pages into existence.
        for i in 0..14 {
            vm.add(Message::user(format!("message number {} {}", i, "x".repeat(400))))
                .await
                .unwrap();
        }
        assert!(vm.get_page_count() > 0);

        let first = retrieval.backfill(vm.store()).await.unwrap();
        assert!(first > 0);
        let second = retrieval.backfill(vm.store()).await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn test_backfill_refused_during_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (vm, mut retrieval) = setup(dir.path());
        retrieval.set_batch_running(true);
        assert_eq!(retrieval.backfill(vm.store()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_auto_fill_harvests_inline_refs() {
        let dir = tempfile::tempdir().unwrap();
        let (mut vm, mut retrieval) = setup(dir.path());

        for i in 0..14 {
            vm.add(Message::user(format!("message number {} {}", i, "y".repeat(400))))
                .await
                .unwrap();
        }
        let page_id = vm.get_pages()[0].id.clone();

        let messages = vec![Message::assistant(format!(
            "see earlier work @@ref('{}')@@",
            page_id
        ))];
        let queued = retrieval
            .auto_fill_page_slots(&mut vm, &messages)
            .await
            .unwrap();
        assert_eq!(queued, 1);

        let assembled = vm.messages().await.unwrap();
        assert!(assembled
            .iter()
            .any(|m| m.content.contains(&format!("Loaded Page: {}", page_id))));
    }

    #[tokio::test]
    async fn test_auto_fill_skips_unref_history_and_unchanged_window() {
        let dir = tempfile::tempdir().unwrap();
        let (mut vm, mut retrieval) = setup(dir.path());

        for i in 0..14 {
            vm.add(Message::user(format!("message number {} {}", i, "z".repeat(400))))
                .await
                .unwrap();
        }
        let page_id = vm.get_pages()[0].id.clone();
        vm.unref_page(&page_id);
        let _ = vm.messages().await.unwrap();

        let messages = vec![Message::assistant(format!("@@ref('{}')@@", page_id))];
        let queued = retrieval
            .auto_fill_page_slots(&mut vm, &messages)
            .await
            .unwrap();
        assert_eq!(queued, 0);

        // Same window again: change detection short-circuits.
        let queued = retrieval
            .auto_fill_page_slots(&mut vm, &messages)
            .await
            .unwrap();
        assert_eq!(queued, 0);
    }
}
