//! VirtualMemory — the paging engine
//!
//! A swim-lane paging layer over the conversation buffer. Messages are
//! partitioned by role into four lanes with proportional token budgets;
//! when a lane crosses its high-water mark, its older messages are evicted
//! to a durable page and replaced inline with a single refable summary
//! message.
//!
//! The original system prompt lives outside the buffer and is never paged.
//! Ref/unref requests queue up and resolve lazily inside `messages()`, so
//! marker handlers can call them at any point without races.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{MemoryConfig, SummaryMode};
use crate::driver::ChatDriver;
use crate::markers::unref_marker;

use super::message::{Message, MessageRole, VM_PROVENANCE};
use super::page::{Page, PageMeta};
use super::store::{write_json_atomic, PageStore};
use super::summarize::{pending_summary, summarize_content};
use super::tokens::TokenEstimator;
use crate::batch::queue::{QueueEntry, SummarizationQueue};

/// Importance at or above this survives eviction in place.
pub const IMPORTANCE_KEEP_THRESHOLD: f32 = 0.7;

/// Ceiling on the scaled high-water ratio.
pub const MAX_HIGH_RATIO: f32 = 0.95;

/// One-shot overrides for a compaction pass.
#[derive(Debug, Clone, Default)]
pub struct CompactionHints {
    pub high_ratio: Option<f32>,
    pub min_recent: Option<usize>,
    /// Page every lane regardless of watermarks. Protected messages still
    /// never move.
    pub force: bool,
}

impl CompactionHints {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }
}

/// A page created by an eviction pass, drained by the retrieval layer for
/// live indexing.
#[derive(Debug, Clone)]
pub struct NewPage {
    pub id: String,
    pub label: String,
    pub summary: String,
}

/// Thinking-budget state: baselines are captured on the first
/// `set_thinking_budget` call and scaled from then on.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThinkingState {
    budget: f32,
    base_wm_tokens: usize,
    base_high_ratio: f32,
    base_min_recent: usize,
}

#[derive(Serialize, Deserialize)]
struct SessionFile {
    version: u32,
    system_prompt: Option<String>,
    messages: Vec<Message>,
    next_seq: u64,
    unref_history: Vec<String>,
    pending_refs: Vec<String>,
    pending_unrefs: Vec<String>,
    thinking: Option<ThinkingState>,
    model: Option<String>,
    saved_at: DateTime<Utc>,
}

/// Per-lane numbers for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStats {
    pub lane: MessageRole,
    pub messages: usize,
    pub tokens: usize,
    pub budget: usize,
    pub high_water: usize,
}

/// Snapshot of memory state, consumed by the sensory buffer.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub model: Option<String>,
    pub thinking_budget: Option<f32>,
    pub working_memory_tokens: usize,
    pub working_memory_used: usize,
    pub page_slot_tokens: usize,
    pub page_slot_used: usize,
    pub min_recent: usize,
    pub lanes: Vec<LaneStats>,
    pub buffer_messages: usize,
    pub page_count: usize,
    pub loaded_pages: Vec<String>,
    pub queue_depth: usize,
}

/// The paging engine.
pub struct VirtualMemory {
    config: MemoryConfig,
    estimator: TokenEstimator,
    store: PageStore,
    queue: SummarizationQueue,
    driver: Arc<dyn ChatDriver>,
    system_prompt: Option<String>,
    buffer: Vec<Message>,
    next_seq: u64,
    model: Option<String>,
    thinking: Option<ThinkingState>,
    pending_refs: Vec<String>,
    pending_unrefs: Vec<String>,
    unref_history: HashSet<String>,
    protected: HashSet<u64>,
    new_pages: Vec<NewPage>,
    // runOnce monitor: one eviction at a time, one coalesced pending slot
    evicting: bool,
    eviction_pending: bool,
    pending_hints: Option<CompactionHints>,
}

impl VirtualMemory {
    pub fn new(config: MemoryConfig, driver: Arc<dyn ChatDriver>) -> Result<Self> {
        let store = PageStore::open(config.pages_dir())
            .context("Failed to open page store")?;
        // Complete any index swap that crashed between the shadow write
        // and the rename.
        store
            .recover_orphaned_shadow()
            .context("Failed to recover orphaned shadow index")?;
        let queue = SummarizationQueue::open(config.queue_path())
            .context("Failed to open summarization queue")?;
        let estimator = TokenEstimator::new(config.avg_chars_per_token);

        Ok(Self {
            config,
            estimator,
            store,
            queue,
            driver,
            system_prompt: None,
            buffer: Vec::new(),
            next_seq: 0,
            model: None,
            thinking: None,
            pending_refs: Vec::new(),
            pending_unrefs: Vec::new(),
            unref_history: HashSet::new(),
            protected: HashSet::new(),
            new_pages: Vec::new(),
            evicting: false,
            eviction_pending: false,
            pending_hints: None,
        })
    }

    /// Set the original system prompt; it always leads the assembled turn
    /// and is never paged.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub fn buffer(&self) -> &[Message] {
        &self.buffer
    }

    pub fn get_pages(&self) -> &[PageMeta] {
        self.store.list()
    }

    pub fn get_page_count(&self) -> usize {
        self.store.page_count()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.size()
    }

    pub fn unref_history(&self) -> &HashSet<String> {
        &self.unref_history
    }

    pub fn is_page_active(&self, id: &str) -> bool {
        self.store.active_page_ids().iter().any(|a| a == id)
    }

    /// Token total of currently loaded pages, from manifest metadata.
    pub fn loaded_page_tokens(&self) -> usize {
        self.store
            .active_page_ids()
            .iter()
            .filter_map(|id| self.store.meta(id))
            .map(|m| m.tokens)
            .sum()
    }

    /// Pages created since the last drain, for live indexing.
    pub fn drain_new_pages(&mut self) -> Vec<NewPage> {
        std::mem::take(&mut self.new_pages)
    }

    // ------------------------------------------------------------------
    // Compaction knobs
    // ------------------------------------------------------------------

    /// Record the active chat model; surfaced through stats for the HUD.
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = Some(model.into());
    }

    /// Set the thinking budget `b` in [0, 1]. Baselines are captured from
    /// the configuration on the first call; afterwards the working-memory
    /// size, high-water ratio and minimum retained messages scale with
    /// `b`: low budget means aggressive compaction, high budget keeps
    /// more.
    pub fn set_thinking_budget(&mut self, budget: f32) {
        let budget = budget.clamp(0.0, 1.0);
        match &mut self.thinking {
            Some(state) => state.budget = budget,
            None => {
                self.thinking = Some(ThinkingState {
                    budget,
                    base_wm_tokens: self.config.working_memory_tokens,
                    base_high_ratio: self.config.high_ratio,
                    base_min_recent: self.config.min_recent,
                });
            }
        }
    }

    pub fn thinking_budget(&self) -> Option<f32> {
        self.thinking.as_ref().map(|t| t.budget)
    }

    fn effective_wm_tokens(&self) -> usize {
        match &self.thinking {
            Some(t) => {
                let scale = 0.6 + t.budget;
                (t.base_wm_tokens as f32 * scale).round() as usize
            }
            None => self.config.working_memory_tokens,
        }
    }

    fn effective_high_ratio(&self) -> f32 {
        match &self.thinking {
            Some(t) => (t.base_high_ratio * (0.75 + t.budget * 0.5)).min(MAX_HIGH_RATIO),
            None => self.config.high_ratio,
        }
    }

    fn effective_min_recent(&self) -> usize {
        match &self.thinking {
            Some(t) => {
                let scale = 0.6 + t.budget;
                ((t.base_min_recent as f32 * scale).round() as usize).max(2)
            }
            None => self.config.min_recent,
        }
    }

    // ------------------------------------------------------------------
    // Protection
    // ------------------------------------------------------------------

    pub fn protect_message(&mut self, seq: u64) {
        self.protected.insert(seq);
    }

    pub fn unprotect_message(&mut self, seq: u64) {
        self.protected.remove(&seq);
    }

    /// Clear all turn-scoped protection, including per-message flags.
    pub fn clear_protected_messages(&mut self) {
        self.protected.clear();
        for message in &mut self.buffer {
            message.protected = false;
        }
    }

    fn is_protected(&self, message: &Message) -> bool {
        message.protected || self.protected.contains(&message.seq)
    }

    // ------------------------------------------------------------------
    // Ref / unref
    // ------------------------------------------------------------------

    /// Queue a page load, applied at the next `messages()` call. Unknown
    /// pages are dropped silently at apply time. An explicit ref clears
    /// the id from the unref history.
    pub fn ref_page(&mut self, id: &str) {
        self.unref_history.remove(id);
        if !self.pending_refs.iter().any(|r| r == id) {
            self.pending_refs.push(id.to_string());
        }
    }

    /// Queue a page release and record it in the unref history so
    /// auto-fill never reloads it this session.
    pub fn unref_page(&mut self, id: &str) {
        self.unref_history.insert(id.to_string());
        self.pending_refs.retain(|r| r != id);
        if !self.pending_unrefs.iter().any(|r| r == id) {
            self.pending_unrefs.push(id.to_string());
        }
    }

    // ------------------------------------------------------------------
    // Lane accounting
    // ------------------------------------------------------------------

    fn lane_budget(&self, lane: MessageRole) -> usize {
        let weights = &self.config.lane_weights;
        self.effective_wm_tokens() * weights.weight(lane) as usize / weights.total() as usize
    }

    /// Lane usage. The original system prompt lives outside the buffer,
    /// so the system lane only counts in-buffer system messages.
    fn lane_tokens(&self, lane: MessageRole) -> usize {
        self.buffer
            .iter()
            .filter(|m| m.role == lane)
            .map(|m| self.estimator.count_message(m))
            .sum()
    }

    fn working_memory_used(&self) -> usize {
        self.estimator.count_messages(&self.buffer)
    }

    fn over_budget_lanes(&self, high_ratio: f32) -> Vec<MessageRole> {
        let mut lanes: Vec<MessageRole> = MessageRole::ALL
            .into_iter()
            .filter(|&lane| {
                self.lane_tokens(lane) as f32 > high_ratio * self.lane_budget(lane) as f32
            })
            .collect();
        // Assistant over budget implies tool over budget, preserving
        // tool-call/tool-result pairing.
        if lanes.contains(&MessageRole::Assistant) && !lanes.contains(&MessageRole::Tool) {
            lanes.push(MessageRole::Tool);
        }
        lanes
    }

    // ------------------------------------------------------------------
    // Public contract: add / messages / compaction
    // ------------------------------------------------------------------

    /// Append a message; may trigger an eviction pass.
    pub async fn add(&mut self, mut message: Message) -> Result<()> {
        self.next_seq += 1;
        message.seq = self.next_seq;
        self.buffer.push(message);
        self.on_after_add().await
    }

    async fn on_after_add(&mut self) -> Result<()> {
        if !self.over_budget_lanes(self.effective_high_ratio()).is_empty() {
            self.run_eviction_monitor().await?;
        }
        Ok(())
    }

    /// Run compaction now, overriding thresholds once.
    pub async fn compact_with_hints(&mut self, hints: CompactionHints) -> Result<()> {
        self.pending_hints = Some(hints);
        self.run_eviction_monitor().await
    }

    /// Compact immediately if working-memory usage exceeds `threshold`
    /// (a ratio of the working-memory budget). Returns whether it did.
    pub async fn pre_tool_compact(&mut self, threshold: Option<f32>) -> Result<bool> {
        let threshold = threshold.unwrap_or(self.config.pre_tool_compact_threshold);
        let used = self.working_memory_used() as f32;
        let budget = self.effective_wm_tokens() as f32;
        if used > threshold * budget {
            self.compact_with_hints(CompactionHints::forced()).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Eviction monitor: a single pass runs at a time; requests arriving
    /// mid-pass coalesce into one pending slot.
    async fn run_eviction_monitor(&mut self) -> Result<()> {
        if self.evicting {
            self.eviction_pending = true;
            return Ok(());
        }
        self.evicting = true;
        loop {
            let hints = self.pending_hints.take().unwrap_or_default();
            let result = self.run_eviction_pass(hints).await;
            if result.is_err() {
                self.evicting = false;
                self.eviction_pending = false;
                return result;
            }
            if self.eviction_pending {
                self.eviction_pending = false;
                continue;
            }
            break;
        }
        self.evicting = false;
        Ok(())
    }

    async fn run_eviction_pass(&mut self, hints: CompactionHints) -> Result<()> {
        let high_ratio = hints.high_ratio.unwrap_or_else(|| self.effective_high_ratio());
        let min_recent = hints.min_recent.unwrap_or_else(|| self.effective_min_recent());

        let lanes: Vec<MessageRole> = if hints.force {
            MessageRole::ALL
                .into_iter()
                .filter(|&lane| self.buffer.iter().any(|m| m.role == lane))
                .collect()
        } else {
            self.over_budget_lanes(high_ratio)
        };
        if lanes.is_empty() {
            return Ok(());
        }

        let evicted = self.plan_eviction(&lanes, min_recent);

        // Lanes need at least two older messages to be worth a page.
        let mut paged_lanes: Vec<(MessageRole, Vec<usize>)> = Vec::new();
        for lane in MessageRole::ALL {
            if let Some(indices) = evicted.get(&lane) {
                if indices.len() >= 2 {
                    paged_lanes.push((lane, indices.clone()));
                }
            }
        }
        if paged_lanes.is_empty() {
            return Ok(());
        }

        let before_tokens = self.working_memory_used();
        let before_messages = self.buffer.len();

        let mut evicted_indices: HashSet<usize> = HashSet::new();
        let mut lane_summaries: Vec<Message> = Vec::new();

        for (lane, indices) in &paged_lanes {
            let window: Vec<Message> =
                indices.iter().map(|&i| self.buffer[i].clone()).collect();
            let mut page = Page::from_messages(*lane, &window, &self.estimator);

            let summary = match self.config.summary_mode {
                SummaryMode::Synchronous => {
                    summarize_content(
                        self.driver.as_ref(),
                        &page.id,
                        &page.label,
                        *lane,
                        &page.content,
                        page.message_count,
                    )
                    .await
                }
                SummaryMode::Batched => {
                    pending_summary(page.message_count, &page.label, &page.id)
                }
            };

            page.summary = Some(summary.clone());
            let newly_written = self
                .store
                .write(&page)
                .context("Failed to persist page during eviction")?;
            // Content-addressed duplicate: keep the stored summary, which
            // may already be the real one.
            let summary = if newly_written {
                summary
            } else {
                match self.store.read(&page.id) {
                    Ok(existing) => existing.summary.unwrap_or(summary),
                    Err(_) => summary,
                }
            };
            if newly_written && self.config.summary_mode == SummaryMode::Batched {
                self.queue
                    .enqueue(QueueEntry::new(&page.id, &page.label, *lane))
                    .context("Failed to enqueue summarization task")?;
            }

            self.new_pages.push(NewPage {
                id: page.id.clone(),
                label: page.label.clone(),
                summary: summary.clone(),
            });

            self.next_seq += 1;
            let mut summary_message = Message::new(*lane, summary)
                .with_provenance(VM_PROVENANCE);
            summary_message.seq = self.next_seq;
            lane_summaries.push(summary_message);

            evicted_indices.extend(indices.iter().copied());
            debug!(
                "Paged {} {} messages into {}",
                indices.len(),
                lane,
                page.id
            );
        }

        // Rebuild: lane summaries first, kept messages in original order.
        let mut rebuilt = lane_summaries;
        for (i, message) in self.buffer.iter().enumerate() {
            if !evicted_indices.contains(&i) {
                rebuilt.push(message.clone());
            }
        }
        self.buffer = rebuilt;

        let after_tokens = self.working_memory_used();
        info!(
            "Eviction pass reclaimed {} tokens ({} -> {}), {} -> {} messages, lanes: {}",
            before_tokens.saturating_sub(after_tokens),
            before_tokens,
            after_tokens,
            before_messages,
            self.buffer.len(),
            paged_lanes
                .iter()
                .map(|(lane, idx)| format!("{}x{}", lane, idx.len()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Partition the chosen lanes into keep/older sets, returning the
    /// buffer indices to evict per lane.
    fn plan_eviction(
        &self,
        lanes: &[MessageRole],
        min_recent: usize,
    ) -> HashMap<MessageRole, Vec<usize>> {
        let mut evicted: HashSet<usize> = HashSet::new();

        for &lane in lanes {
            let lane_indices: Vec<usize> = self
                .buffer
                .iter()
                .enumerate()
                .filter(|(_, m)| m.role == lane)
                .map(|(i, _)| i)
                .collect();
            let tail_start = lane_indices.len().saturating_sub(min_recent);
            for (pos, &i) in lane_indices.iter().enumerate() {
                let message = &self.buffer[i];
                if pos >= tail_start {
                    continue;
                }
                if self.is_protected(message) {
                    continue;
                }
                if message.importance.unwrap_or(0.0) >= IMPORTANCE_KEEP_THRESHOLD {
                    continue;
                }
                evicted.insert(i);
            }
        }

        self.back_scan_assistant_boundary(&mut evicted);
        self.close_tool_pairs(lanes, min_recent, &mut evicted);

        let mut by_lane: HashMap<MessageRole, Vec<usize>> = HashMap::new();
        for &i in &evicted {
            by_lane.entry(self.buffer[i].role).or_default().push(i);
        }
        for indices in by_lane.values_mut() {
            indices.sort_unstable();
        }
        by_lane
    }

    /// Keep walking the assistant cut boundary backwards while it would
    /// land just before a kept tool message, which would orphan the
    /// result.
    fn back_scan_assistant_boundary(&self, evicted: &mut HashSet<usize>) {
        loop {
            let last_evicted_assistant = self
                .buffer
                .iter()
                .enumerate()
                .rev()
                .find(|(i, m)| m.role == MessageRole::Assistant && evicted.contains(i))
                .map(|(i, _)| i);
            match last_evicted_assistant {
                Some(i)
                    if i + 1 < self.buffer.len()
                        && self.buffer[i + 1].role == MessageRole::Tool
                        && !evicted.contains(&(i + 1)) =>
                {
                    evicted.remove(&i);
                }
                _ => break,
            }
        }
    }

    /// Close the evicted set under tool-call/tool-result pairing: a tool
    /// result never pages without its producing assistant message, and a
    /// paged assistant message drags its result along unless the result
    /// must stay (protected, important, recent tail, or its lane was not
    /// chosen) — then the assistant is kept instead.
    fn close_tool_pairs(
        &self,
        lanes: &[MessageRole],
        min_recent: usize,
        evicted: &mut HashSet<usize>,
    ) {
        let tool_indices: Vec<usize> = self
            .buffer
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == MessageRole::Tool)
            .map(|(i, _)| i)
            .collect();
        let tool_tail_start = tool_indices.len().saturating_sub(min_recent);

        let pairs: Vec<(usize, usize, usize)> = tool_indices
            .iter()
            .enumerate()
            .filter_map(|(pos, &t)| {
                let producer = self.buffer[..t]
                    .iter()
                    .rposition(|m| m.role == MessageRole::Assistant)?;
                Some((t, producer, pos))
            })
            .collect();

        loop {
            let mut changed = false;
            for &(t, a, tool_pos) in &pairs {
                let tool_evicted = evicted.contains(&t);
                let assistant_evicted = evicted.contains(&a);
                if tool_evicted && !assistant_evicted {
                    evicted.remove(&t);
                    changed = true;
                } else if assistant_evicted && !tool_evicted {
                    let message = &self.buffer[t];
                    let must_stay = self.is_protected(message)
                        || message.importance.unwrap_or(0.0) >= IMPORTANCE_KEEP_THRESHOLD
                        || !lanes.contains(&MessageRole::Tool)
                        || tool_pos >= tool_tail_start;
                    if must_stay {
                        evicted.remove(&a);
                    } else {
                        evicted.insert(t);
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Assemble the turn input: system prompt, loaded-page block, recent
    /// window. Resolves pending ref/unref requests and evicts over-budget
    /// loaded pages; otherwise side-effect free.
    pub async fn messages(&mut self) -> Result<Vec<Message>> {
        let mut active: Vec<String> = self.store.active_page_ids().to_vec();
        let mut load_order: Vec<String> = self.store.load_order().to_vec();

        // 1. pending unrefs
        for id in std::mem::take(&mut self.pending_unrefs) {
            active.retain(|a| *a != id);
            load_order.retain(|a| *a != id);
        }

        // 2. pending refs, appended to load order; unknown pages dropped
        for id in std::mem::take(&mut self.pending_refs) {
            if !self.store.has_page(&id) {
                debug!("Dropping ref for unknown page {}", id);
                continue;
            }
            if !active.contains(&id) {
                active.push(id.clone());
                load_order.push(id);
            }
        }

        // 3. render loaded pages, dropping unreadable ones
        let mut rendered: Vec<(String, String, usize)> = Vec::new();
        for id in &load_order {
            if !active.contains(id) {
                continue;
            }
            match self.store.read(id) {
                Ok(page) => {
                    let block = format!(
                        "--- Loaded Page: {} ({}) ---\n{}\n--- End Page {}: release with {} when no longer needed ---",
                        page.id,
                        page.label,
                        page.content,
                        page.id,
                        unref_marker(&page.id)
                    );
                    let tokens = self.estimator.count(&block);
                    rendered.push((id.clone(), block, tokens));
                }
                Err(e) => {
                    warn!("Loaded page {} unreadable, unloading: {}", id, e);
                    active.retain(|a| a != id);
                }
            }
        }
        load_order.retain(|id| active.contains(id));

        // evict loaded pages while over the page-slot budget, oldest first
        let mut slot_used: usize = rendered.iter().map(|(_, _, t)| *t).sum();
        while slot_used > self.config.page_slot_tokens && !rendered.is_empty() {
            let (id, _, tokens) = rendered.remove(0);
            info!("Page slot over budget, unloading oldest page {}", id);
            active.retain(|a| *a != id);
            load_order.retain(|a| *a != id);
            slot_used -= tokens;
        }

        self.store
            .set_runtime_state(active, load_order)
            .context("Failed to persist loaded-page state")?;

        // 4. system prompt first
        let mut out = Vec::new();
        if let Some(prompt) = &self.system_prompt {
            out.push(Message::system(prompt.clone()));
        }

        // 5. one synthetic system message per loaded page
        for (_, block, _) in &rendered {
            out.push(Message::system(block.clone()).with_provenance(VM_PROVENANCE));
        }

        // 6. recent window, newest to oldest, within budget
        let wm = self.effective_wm_tokens();
        let floor = self.effective_min_recent() * 4;
        let ceiling = wm * 2;
        let mut window_rev: Vec<Message> = Vec::new();
        let mut cumulative = 0usize;
        for message in self.buffer.iter().rev() {
            let tokens = self.estimator.count_message(message);
            let fits_budget = cumulative + tokens <= wm;
            let fits_floor = window_rev.len() < floor && cumulative + tokens <= ceiling;
            if fits_budget || fits_floor {
                cumulative += tokens;
                window_rev.push(message.clone());
            } else {
                break;
            }
        }
        window_rev.reverse();

        // The window is a contiguous buffer suffix; a tool result with no
        // assistant message before it in the window lost its producer at
        // the cut and must not appear orphaned.
        let mut seen_assistant = false;
        for message in window_rev {
            if message.role == MessageRole::Tool && !message.is_synthetic() && !seen_assistant {
                continue;
            }
            if message.role == MessageRole::Assistant {
                seen_assistant = true;
            }
            out.push(message);
        }

        Ok(out)
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn get_stats(&self) -> MemoryStats {
        let high_ratio = self.effective_high_ratio();
        let lanes = MessageRole::ALL
            .into_iter()
            .map(|lane| {
                let budget = self.lane_budget(lane);
                LaneStats {
                    lane,
                    messages: self.buffer.iter().filter(|m| m.role == lane).count(),
                    tokens: self.lane_tokens(lane),
                    budget,
                    high_water: (budget as f32 * high_ratio) as usize,
                }
            })
            .collect();

        MemoryStats {
            model: self.model.clone(),
            thinking_budget: self.thinking_budget(),
            working_memory_tokens: self.effective_wm_tokens(),
            working_memory_used: self.working_memory_used(),
            page_slot_tokens: self.config.page_slot_tokens,
            page_slot_used: self.loaded_page_tokens(),
            min_recent: self.effective_min_recent(),
            lanes,
            buffer_messages: self.buffer.len(),
            page_count: self.store.page_count(),
            loaded_pages: self.store.active_page_ids().to_vec(),
            queue_depth: self.queue.size(),
        }
    }

    // ------------------------------------------------------------------
    // Session persistence
    // ------------------------------------------------------------------

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.config
            .sessions_dir()
            .join(format!("{}.json", session_id))
    }

    /// Persist the message buffer and the page manifest.
    pub async fn save(&mut self, session_id: &str) -> Result<()> {
        std::fs::create_dir_all(self.config.sessions_dir())
            .context("Failed to create sessions directory")?;
        let session = SessionFile {
            version: 1,
            system_prompt: self.system_prompt.clone(),
            messages: self.buffer.clone(),
            next_seq: self.next_seq,
            unref_history: self.unref_history.iter().cloned().collect(),
            pending_refs: self.pending_refs.clone(),
            pending_unrefs: self.pending_unrefs.clone(),
            thinking: self.thinking.clone(),
            model: self.model.clone(),
            saved_at: Utc::now(),
        };
        write_json_atomic(&self.session_path(session_id), &session)
            .context("Failed to write session file")?;
        self.store
            .save_manifest()
            .context("Failed to save page manifest")?;
        info!("Saved session {} ({} messages)", session_id, self.buffer.len());
        Ok(())
    }

    /// Restore the message buffer and reload the page manifest.
    pub async fn load(&mut self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session {}", session_id))?;
        let session: SessionFile =
            serde_json::from_str(&raw).context("Failed to parse session file")?;

        self.system_prompt = session.system_prompt;
        self.buffer = session.messages;
        self.next_seq = session.next_seq;
        self.unref_history = session.unref_history.into_iter().collect();
        self.pending_refs = session.pending_refs;
        self.pending_unrefs = session.pending_unrefs;
        self.thinking = session.thinking;
        self.model = session.model;
        self.protected.clear();
        self.store
            .reload_manifest()
            .context("Failed to reload page manifest")?;
        info!("Loaded session {} ({} messages)", session_id, self.buffer.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::FixedDriver;

    fn test_config(
        dir: &std::path::Path,
        wm_tokens: usize,
        high_ratio: f32,
        min_recent: usize,
    ) -> MemoryConfig {
        let mut config = MemoryConfig::new(dir);
        config.working_memory_tokens = wm_tokens;
        config.high_ratio = high_ratio;
        config.min_recent = min_recent;
        config
    }

    fn test_driver() -> Arc<FixedDriver> {
        Arc::new(FixedDriver::new("STATUS: compacted\n- details kept"))
    }

    fn vm_with(config: MemoryConfig) -> VirtualMemory {
        VirtualMemory::new(config, test_driver())
            .unwrap()
            .with_system_prompt("system prompt")
    }

    /// Working window of an assembled turn: everything after the system
    /// prompt and the loaded-page blocks.
    fn window_of(assembled: &[Message]) -> Vec<&Message> {
        assembled
            .iter()
            .skip_while(|m| m.role == MessageRole::System && m.seq == 0)
            .collect()
    }

    #[tokio::test]
    async fn test_watermark_eviction_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 100, 0.75, 2));

        for i in 0..20 {
            vm.add(Message::user(format!("u{:02}{}", i, "x".repeat(46))))
                .await
                .unwrap();
        }
        for i in 0..20 {
            vm.add(Message::assistant(format!("a{:02}{}", i, "y".repeat(46))))
                .await
                .unwrap();
        }

        assert!(vm.get_page_count() >= 1);
        assert!(vm
            .get_pages()
            .iter()
            .any(|p| p.lane == MessageRole::Assistant));

        let assembled = vm.messages().await.unwrap();
        let text: Vec<&str> = assembled.iter().map(|m| m.content.as_str()).collect();
        assert!(text.iter().any(|t| t.starts_with("a19")));
        assert!(text.iter().any(|t| t.starts_with("a18")));
    }

    #[tokio::test]
    async fn test_importance_preservation_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 2000, 0.75, 2));

        for i in 0..10 {
            let mut message = Message::assistant(format!("m{:02} {}", i, "z".repeat(195)));
            if i == 2 {
                message = message.with_importance(0.9);
            }
            vm.add(message).await.unwrap();
        }

        assert!(vm.get_page_count() >= 1);
        let assembled = vm.messages().await.unwrap();
        assert!(assembled
            .iter()
            .any(|m| m.content.starts_with("m02") && !m.is_synthetic()));

        let page = vm.store().read(&vm.get_pages()[0].id).unwrap();
        assert!(page.content.contains("m00"));
        assert!(page.content.contains("m01"));
        assert!(!page.content.contains("m02"));
    }

    #[tokio::test]
    async fn test_tool_pairing_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 150, 0.75, 2));

        vm.add(Message::assistant(format!("callA {}", "c".repeat(195))))
            .await
            .unwrap();
        vm.add(Message::tool(format!("resultA {}", "r".repeat(195))))
            .await
            .unwrap();
        for i in 0..4 {
            vm.add(Message::assistant(format!("text{} {}", i, "t".repeat(195))))
                .await
                .unwrap();
        }

        // The pair survives eviction together.
        let has_call = vm.buffer().iter().any(|m| m.content.starts_with("callA"));
        let has_result = vm.buffer().iter().any(|m| m.content.starts_with("resultA"));
        assert_eq!(has_call, has_result);

        // And no assembly ever shows the result without the call.
        let assembled = vm.messages().await.unwrap();
        let result_shown = assembled
            .iter()
            .any(|m| m.content.starts_with("resultA") && !m.is_synthetic());
        let call_shown = assembled
            .iter()
            .any(|m| m.content.starts_with("callA") && !m.is_synthetic());
        if result_shown {
            assert!(call_shown);
        }
    }

    #[tokio::test]
    async fn test_system_prompt_always_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 100, 0.75, 2));

        for i in 0..30 {
            vm.add(Message::user(format!("msg {} {}", i, "p".repeat(80))))
                .await
                .unwrap();
            let assembled = vm.messages().await.unwrap();
            assert_eq!(assembled[0].content, "system prompt");
            assert_eq!(assembled[0].role, MessageRole::System);
        }
    }

    #[tokio::test]
    async fn test_window_budget_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 100, 0.75, 2);
        let estimator = TokenEstimator::new(config.avg_chars_per_token);
        let mut vm = vm_with(config);

        for i in 0..40 {
            vm.add(Message::user(format!("filler {} {}", i, "q".repeat(60))))
                .await
                .unwrap();
        }

        let assembled = vm.messages().await.unwrap();
        let window = window_of(&assembled);
        let window_tokens: usize = window
            .iter()
            .map(|m| estimator.count_message(m))
            .sum();
        assert!(window_tokens <= 100 * 2);
        let floor = 2 * 4;
        assert!(window.len() >= floor.min(vm.buffer().len()) || window_tokens > 100);
    }

    #[tokio::test]
    async fn test_ref_unref_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 100, 0.75, 2));

        for i in 0..10 {
            vm.add(Message::user(format!("build pages {} {}", i, "b".repeat(80))))
                .await
                .unwrap();
        }
        let page_id = vm.get_pages()[0].id.clone();

        // ref then unref cancels out.
        vm.ref_page(&page_id);
        vm.unref_page(&page_id);
        vm.messages().await.unwrap();
        assert!(vm.store().active_page_ids().is_empty());

        // unref then ref on a loaded page keeps it loaded.
        vm.ref_page(&page_id);
        vm.messages().await.unwrap();
        assert!(vm.is_page_active(&page_id));
        vm.unref_page(&page_id);
        vm.ref_page(&page_id);
        vm.messages().await.unwrap();
        assert!(vm.is_page_active(&page_id));
    }

    #[tokio::test]
    async fn test_unref_history_blocks_nothing_but_autofill() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 100, 0.75, 2));
        for i in 0..10 {
            vm.add(Message::user(format!("history {} {}", i, "h".repeat(80))))
                .await
                .unwrap();
        }
        let page_id = vm.get_pages()[0].id.clone();

        vm.ref_page(&page_id);
        vm.messages().await.unwrap();
        vm.unref_page(&page_id);
        vm.messages().await.unwrap();
        assert!(vm.unref_history().contains(&page_id));
        assert!(!vm.is_page_active(&page_id));

        // An explicit re-ref overrides the history.
        vm.ref_page(&page_id);
        assert!(!vm.unref_history().contains(&page_id));
    }

    #[tokio::test]
    async fn test_unknown_ref_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 100, 0.75, 2));
        vm.ref_page("pg_does_not_exist");
        vm.messages().await.unwrap();
        assert!(vm.store().active_page_ids().is_empty());
    }

    #[tokio::test]
    async fn test_page_slot_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), 200, 0.75, 2);
        config.page_slot_tokens = 250;
        let mut vm = vm_with(config);

        for i in 0..8 {
            vm.add(Message::user(format!("first topic {} {}", i, "f".repeat(150))))
                .await
                .unwrap();
        }
        for i in 0..8 {
            vm.add(Message::user(format!("second topic {} {}", i, "s".repeat(150))))
                .await
                .unwrap();
        }
        let pages: Vec<String> = vm.get_pages().iter().map(|p| p.id.clone()).collect();
        assert!(pages.len() >= 2);

        vm.ref_page(&pages[0]);
        vm.messages().await.unwrap();
        assert!(vm.is_page_active(&pages[0]));

        vm.ref_page(&pages[1]);
        vm.messages().await.unwrap();
        // Slot budget fits one page only; the oldest load went first.
        assert!(!vm.is_page_active(&pages[0]));
        assert!(vm.is_page_active(&pages[1]));
    }

    #[tokio::test]
    async fn test_loaded_page_framing() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 100, 0.75, 2));
        for i in 0..10 {
            vm.add(Message::user(format!("frame {} {}", i, "g".repeat(80))))
                .await
                .unwrap();
        }
        let page_id = vm.get_pages()[0].id.clone();
        vm.ref_page(&page_id);

        let assembled = vm.messages().await.unwrap();
        let block = assembled
            .iter()
            .find(|m| m.content.contains("Loaded Page"))
            .expect("page block present");
        assert!(block.content.contains(&format!("--- Loaded Page: {}", page_id)));
        assert!(block
            .content
            .contains(&format!("@@unref('{}')@@", page_id)));
        assert_eq!(block.role, MessageRole::System);
        assert!(block.is_synthetic());
    }

    #[tokio::test]
    async fn test_protected_messages_never_move_even_forced() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 2000, 0.75, 2));

        vm.add(Message::user(format!("keep me safe {}", "k".repeat(200))).protected())
            .await
            .unwrap();
        for i in 0..8 {
            vm.add(Message::user(format!("bulk {} {}", i, "u".repeat(200))))
                .await
                .unwrap();
        }

        vm.compact_with_hints(CompactionHints::forced()).await.unwrap();
        assert!(vm
            .buffer()
            .iter()
            .any(|m| m.content.starts_with("keep me safe")));
        for page in vm.get_pages() {
            let page = vm.store().read(&page.id).unwrap();
            assert!(!page.content.contains("keep me safe"));
        }
    }

    #[tokio::test]
    async fn test_protect_by_seq_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 2000, 0.75, 2));

        vm.add(Message::user(format!("shielded {}", "s".repeat(200))))
            .await
            .unwrap();
        let seq = vm.buffer()[0].seq;
        vm.protect_message(seq);
        for i in 0..8 {
            vm.add(Message::user(format!("noise {} {}", i, "n".repeat(200))))
                .await
                .unwrap();
        }

        vm.compact_with_hints(CompactionHints::forced()).await.unwrap();
        assert!(vm.buffer().iter().any(|m| m.content.starts_with("shielded")));

        vm.clear_protected_messages();
        vm.compact_with_hints(CompactionHints::forced()).await.unwrap();
        assert!(!vm.buffer().iter().any(|m| m.content.starts_with("shielded")));
    }

    #[tokio::test]
    async fn test_thinking_budget_scaling() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 1000, 0.75, 4));

        assert_eq!(vm.get_stats().working_memory_tokens, 1000);

        vm.set_thinking_budget(0.0);
        let stats = vm.get_stats();
        assert_eq!(stats.working_memory_tokens, 600);
        assert_eq!(stats.min_recent, 2);

        vm.set_thinking_budget(1.0);
        let stats = vm.get_stats();
        assert_eq!(stats.working_memory_tokens, 1600);
        assert_eq!(stats.min_recent, 6);

        // High ratio scales but caps at 0.95.
        assert!((vm.effective_high_ratio() - 0.75 * 1.25).abs() < 1e-6);
        vm.set_thinking_budget(1.0);
        let mut high_config = test_config(dir.path(), 1000, 0.9, 4);
        high_config.data_dir = dir.path().join("other");
        let mut other = vm_with(high_config);
        other.set_thinking_budget(1.0);
        assert!((other.effective_high_ratio() - 0.95).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_pre_tool_compact() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 5000, 0.99, 2));

        assert!(!vm.pre_tool_compact(None).await.unwrap());

        for i in 0..12 {
            vm.add(Message::user(format!("load {} {}", i, "l".repeat(220))))
                .await
                .unwrap();
        }
        // Usage (~1100 tokens) sits below every watermark but above a 20%
        // pre-tool threshold.
        let before = vm.get_page_count();
        assert!(vm.pre_tool_compact(Some(0.2)).await.unwrap());
        assert!(vm.get_page_count() > before);
        assert!(!vm.pre_tool_compact(Some(0.99)).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 100, 0.75, 2);
        let mut vm = vm_with(config.clone());

        for i in 0..12 {
            vm.add(Message::user(format!("persist {} {}", i, "v".repeat(80))))
                .await
                .unwrap();
        }
        vm.set_model("test-model");
        vm.set_thinking_budget(0.8);
        vm.save("session-a").await.unwrap();

        let mut restored = vm_with(config);
        restored.load("session-a").await.unwrap();
        assert_eq!(restored.buffer(), vm.buffer());
        assert_eq!(restored.get_page_count(), vm.get_page_count());
        assert_eq!(restored.thinking_budget(), Some(0.8));
        assert_eq!(
            restored.get_stats().model.as_deref(),
            Some("test-model")
        );
    }

    #[tokio::test]
    async fn test_lane_summary_replaces_older_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 100, 0.75, 2));

        for i in 0..6 {
            vm.add(Message::user(format!("old {} {}", i, "o".repeat(60))))
                .await
                .unwrap();
        }

        let summary = vm
            .buffer()
            .iter()
            .find(|m| m.is_synthetic())
            .expect("lane summary present");
        assert_eq!(summary.role, MessageRole::User);
        let refs = crate::markers::harvest_refs(&summary.content);
        assert!(!refs.is_empty());
        assert!(vm.store().has_page(&refs[0]));
    }

    #[tokio::test]
    async fn test_forced_compaction_pages_every_lane() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = vm_with(test_config(dir.path(), 100_000, 0.75, 2));

        for i in 0..5 {
            vm.add(Message::user(format!("user {} {}", i, "1".repeat(50))))
                .await
                .unwrap();
            vm.add(Message::assistant(format!("asst {} {}", i, "2".repeat(50))))
                .await
                .unwrap();
        }
        assert_eq!(vm.get_page_count(), 0);

        vm.compact_with_hints(CompactionHints::forced()).await.unwrap();
        let lanes: std::collections::HashSet<MessageRole> =
            vm.get_pages().iter().map(|p| p.lane).collect();
        assert!(lanes.contains(&MessageRole::User));
        assert!(lanes.contains(&MessageRole::Assistant));
    }
}
