//! Chat driver seam
//!
//! The LLM driver is an external collaborator: the paging engine only needs
//! a single-shot completion call for summary generation. Hosts inject their
//! own implementation; tests use canned responses.

use anyhow::Result;

/// Instruction for the page summarizer.
///
/// The same prompt is used on the synchronous path, by the batch worker,
/// and by the batch rebuild.
pub const SUMMARIZER_INSTRUCTION: &str = r#"You are a memory page summarizer for a long-running AI agent. Old conversation messages have been evicted to a durable page; your summary replaces them inline, so it must let the agent resume work without the originals.

RULES:
1. Begin with a single line starting with "STATUS:" stating where the work stands.
2. Then output dense bullets: decisions made, facts learned, names, paths, numbers, open threads.
3. Preserve every line tagged @@important@@ VERBATIM, without the tag.
4. Omit every line tagged @@ephemeral@@ entirely.
5. Target roughly 400 words. Density beats prose.
6. End with the page reference marker you were given, exactly as provided, so the full page can be reloaded later."#;

/// A chat-completion driver.
///
/// Implementations are expected to suspend (network call); the engine never
/// retries at this layer.
#[async_trait::async_trait]
pub trait ChatDriver: Send + Sync {
    /// Run one completion: `system` instruction plus `prompt` content,
    /// returning the raw model text.
    async fn chat(&self, system: &str, prompt: &str) -> Result<String>;
}
