//! Sensory buffer
//!
//! A decorator around any [`AgentMemory`] that injects one synthetic
//! system message immediately after the real system prompt, rendering up
//! to three "camera slots" of memory state so the agent perceives its own
//! context. All memory operations delegate to the inner implementation.

pub mod channels;

pub use channels::{
    ChannelContext, ChannelRegistry, SensoryChannel, DEFAULT_CHANNEL_SIZE,
    FULLSCREEN_CHANNEL_SIZE,
};

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use tracing::debug;

use crate::memory::message::{Message, MessageRole, VM_PROVENANCE};
use crate::memory::virtual_memory::{CompactionHints, MemoryStats};
use crate::memory::AgentMemory;

/// Number of camera slots.
pub const SLOT_COUNT: usize = 3;

const DEFAULT_SLOTS: [&str; SLOT_COUNT] = ["context-map", "awareness", "config"];

/// Saved state for a one-turn full-screen expansion.
struct Expansion {
    channel: String,
    saved_slots: [String; SLOT_COUNT],
    saved_size: (usize, usize),
    polls_remaining: u8,
}

/// Decorator injecting the sensory buffer into every turn.
pub struct SensoryMemory {
    inner: Box<dyn AgentMemory>,
    registry: ChannelRegistry,
    slots: [String; SLOT_COUNT],
    notes: HashMap<String, String>,
    expansion: Option<Expansion>,
}

impl SensoryMemory {
    pub fn new(inner: Box<dyn AgentMemory>) -> Self {
        Self {
            inner,
            registry: ChannelRegistry::with_defaults(),
            slots: DEFAULT_SLOTS.map(String::from),
            notes: HashMap::new(),
            expansion: None,
        }
    }

    pub fn with_registry(mut self, registry: ChannelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn slots(&self) -> &[String; SLOT_COUNT] {
        &self.slots
    }

    /// Switch a slot to a channel.
    pub fn set_slot(&mut self, slot: usize, channel: &str) -> Result<()> {
        if slot >= SLOT_COUNT {
            anyhow::bail!("Slot {} out of range (0..{})", slot, SLOT_COUNT);
        }
        if !self.registry.contains(channel) {
            anyhow::bail!("Unknown sensory channel: {}", channel);
        }
        self.slots[slot] = channel.to_string();
        Ok(())
    }

    /// Cycle slot 0 through the registered channels.
    pub fn cycle_slot0(&mut self) {
        let names = self.registry.names();
        if names.is_empty() {
            return;
        }
        let current = names.iter().position(|n| *n == self.slots[0]);
        let next = match current {
            Some(i) => (i + 1) % names.len(),
            None => 0,
        };
        self.slots[0] = names[next].clone();
    }

    /// Resize a channel's fixed grid.
    pub fn resize_channel(&mut self, channel: &str, width: usize, height: usize) -> Result<()> {
        if !self.registry.contains(channel) {
            anyhow::bail!("Unknown sensory channel: {}", channel);
        }
        self.registry.set_size(channel, width, height);
        Ok(())
    }

    /// Expand a channel full-screen for exactly one turn. Slot layout and
    /// the channel's size are restored on the second subsequent poll.
    pub fn expand_channel(&mut self, channel: &str) -> Result<()> {
        if !self.registry.contains(channel) {
            anyhow::bail!("Unknown sensory channel: {}", channel);
        }
        if self.expansion.is_some() {
            anyhow::bail!("A channel is already expanded");
        }
        let saved_size = self.registry.size_of(channel);
        self.expansion = Some(Expansion {
            channel: channel.to_string(),
            saved_slots: self.slots.clone(),
            saved_size,
            polls_remaining: 2,
        });
        self.registry.set_size(
            channel,
            FULLSCREEN_CHANNEL_SIZE.0,
            FULLSCREEN_CHANNEL_SIZE.1,
        );
        self.slots = [channel.to_string(), channel.to_string(), channel.to_string()];
        Ok(())
    }

    /// Feed host text into a note channel (tasks, social feed, ...).
    pub fn set_note(&mut self, channel: &str, text: impl Into<String>) {
        self.notes.insert(channel.to_string(), text.into());
    }

    /// Advance the expansion countdown; called once per poll.
    fn tick_expansion(&mut self) {
        let restore = match &mut self.expansion {
            None => return,
            Some(expansion) if expansion.polls_remaining <= 1 => true,
            Some(expansion) => {
                expansion.polls_remaining -= 1;
                false
            }
        };
        if restore {
            if let Some(expansion) = self.expansion.take() {
                self.slots = expansion.saved_slots;
                self.registry.set_size(
                    &expansion.channel,
                    expansion.saved_size.0,
                    expansion.saved_size.1,
                );
                debug!("Sensory expansion of {} restored", expansion.channel);
            }
        }
    }

    /// Render the sensory buffer for the current stats snapshot.
    fn render_buffer(&self, stats: &MemoryStats) -> String {
        let ctx = ChannelContext {
            stats,
            now: Utc::now(),
            notes: &self.notes,
        };

        let mut out = String::from("=== SENSORY BUFFER ===\n");
        if let Some(expansion) = &self.expansion {
            out.push_str(&format!("[fullscreen: {}]\n", expansion.channel));
            if let Some(panel) = self.registry.render(&expansion.channel, &ctx) {
                out.push_str(&panel);
                out.push('\n');
            }
        } else {
            for (i, channel) in self.slots.iter().enumerate() {
                out.push_str(&format!("[slot {}: {}]\n", i, channel));
                if let Some(panel) = self.registry.render(channel, &ctx) {
                    out.push_str(&panel);
                    out.push('\n');
                }
            }
        }
        out.push_str("=== END SENSORY BUFFER ===");
        out
    }

    /// Poll: tick the expansion countdown, render, and wrap as a system
    /// message.
    fn poll(&mut self) -> Message {
        self.tick_expansion();
        let stats = self.inner.stats();
        Message::system(self.render_buffer(&stats)).with_provenance(VM_PROVENANCE)
    }
}

#[async_trait::async_trait]
impl AgentMemory for SensoryMemory {
    async fn add(&mut self, message: Message) -> Result<()> {
        self.inner.add(message).await
    }

    /// Delegate, then inject the sensory buffer immediately after the
    /// real system prompt.
    async fn messages(&mut self) -> Result<Vec<Message>> {
        let mut messages = self.inner.messages().await?;
        let buffer = self.poll();
        let position = match messages.first() {
            Some(first) if first.role == MessageRole::System && !first.is_synthetic() => 1,
            _ => 0,
        };
        messages.insert(position, buffer);
        Ok(messages)
    }

    fn ref_page(&mut self, id: &str) {
        self.inner.ref_page(id);
    }

    fn unref_page(&mut self, id: &str) {
        self.inner.unref_page(id);
    }

    fn set_model(&mut self, model: &str) {
        self.inner.set_model(model);
    }

    fn set_thinking_budget(&mut self, budget: f32) {
        self.inner.set_thinking_budget(budget);
    }

    fn protect_message(&mut self, seq: u64) {
        self.inner.protect_message(seq);
    }

    fn unprotect_message(&mut self, seq: u64) {
        self.inner.unprotect_message(seq);
    }

    fn clear_protected_messages(&mut self) {
        self.inner.clear_protected_messages();
    }

    async fn compact_with_hints(&mut self, hints: CompactionHints) -> Result<()> {
        self.inner.compact_with_hints(hints).await
    }

    async fn pre_tool_compact(&mut self, threshold: Option<f32>) -> Result<bool> {
        self.inner.pre_tool_compact(threshold).await
    }

    fn stats(&self) -> MemoryStats {
        self.inner.stats()
    }

    async fn save(&mut self, session_id: &str) -> Result<()> {
        self.inner.save(session_id).await
    }

    async fn load(&mut self, session_id: &str) -> Result<()> {
        self.inner.load(session_id).await
    }
}
