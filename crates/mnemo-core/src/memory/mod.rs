//! Paged virtual memory for conversational messages
//!
//! The layers, leaves first:
//! 1. Token math and messages - fixed char/token ratio, swim-lane roles
//! 2. Pages and the page store - immutable, content-addressed records
//! 3. Summarization - inline driver calls or batch placeholders
//! 4. VirtualMemory - watermark-driven eviction with refable summaries
//!
//! Retrieval, batch rebuilds and the sensory buffer build on this module.

pub mod message;
pub mod page;
pub mod store;
pub mod summarize;
pub mod tokens;
pub mod virtual_memory;

pub use message::{Message, MessageRole, VM_PROVENANCE};
pub use page::{page_id, Page, PageMeta};
pub use store::PageStore;
pub use tokens::TokenEstimator;
pub use virtual_memory::{
    CompactionHints, LaneStats, MemoryStats, NewPage, VirtualMemory, IMPORTANCE_KEEP_THRESHOLD,
};

use anyhow::Result;

/// The memory surface an agent turn loop drives.
///
/// `VirtualMemory` is the canonical implementation; decorators (the
/// sensory buffer) wrap a boxed trait object and forward explicitly.
#[async_trait::async_trait]
pub trait AgentMemory: Send {
    /// Append a message; may trigger eviction.
    async fn add(&mut self, message: Message) -> Result<()>;

    /// Assemble the turn input: system prompt, loaded pages, recent
    /// window. Resolves pending ref/unref requests.
    async fn messages(&mut self) -> Result<Vec<Message>>;

    /// Queue a page load, applied at the next `messages()` call.
    fn ref_page(&mut self, id: &str);

    /// Queue a page release; recorded in the unref history.
    fn unref_page(&mut self, id: &str);

    fn set_model(&mut self, model: &str);

    /// Thinking budget in [0, 1]; scales compaction aggressiveness.
    fn set_thinking_budget(&mut self, budget: f32);

    fn protect_message(&mut self, seq: u64);
    fn unprotect_message(&mut self, seq: u64);
    fn clear_protected_messages(&mut self);

    /// Run compaction now, overriding thresholds once.
    async fn compact_with_hints(&mut self, hints: CompactionHints) -> Result<()>;

    /// Compact if working-memory usage exceeds `threshold`; returns
    /// whether it did.
    async fn pre_tool_compact(&mut self, threshold: Option<f32>) -> Result<bool>;

    fn stats(&self) -> MemoryStats;

    async fn save(&mut self, session_id: &str) -> Result<()>;
    async fn load(&mut self, session_id: &str) -> Result<()>;
}

#[async_trait::async_trait]
impl AgentMemory for VirtualMemory {
    async fn add(&mut self, message: Message) -> Result<()> {
        VirtualMemory::add(self, message).await
    }

    async fn messages(&mut self) -> Result<Vec<Message>> {
        VirtualMemory::messages(self).await
    }

    fn ref_page(&mut self, id: &str) {
        VirtualMemory::ref_page(self, id);
    }

    fn unref_page(&mut self, id: &str) {
        VirtualMemory::unref_page(self, id);
    }

    fn set_model(&mut self, model: &str) {
        VirtualMemory::set_model(self, model);
    }

    fn set_thinking_budget(&mut self, budget: f32) {
        VirtualMemory::set_thinking_budget(self, budget);
    }

    fn protect_message(&mut self, seq: u64) {
        VirtualMemory::protect_message(self, seq);
    }

    fn unprotect_message(&mut self, seq: u64) {
        VirtualMemory::unprotect_message(self, seq);
    }

    fn clear_protected_messages(&mut self) {
        VirtualMemory::clear_protected_messages(self);
    }

    async fn compact_with_hints(&mut self, hints: CompactionHints) -> Result<()> {
        VirtualMemory::compact_with_hints(self, hints).await
    }

    async fn pre_tool_compact(&mut self, threshold: Option<f32>) -> Result<bool> {
        VirtualMemory::pre_tool_compact(self, threshold).await
    }

    fn stats(&self) -> MemoryStats {
        VirtualMemory::get_stats(self)
    }

    async fn save(&mut self, session_id: &str) -> Result<()> {
        VirtualMemory::save(self, session_id).await
    }

    async fn load(&mut self, session_id: &str) -> Result<()> {
        VirtualMemory::load(self, session_id).await
    }
}
