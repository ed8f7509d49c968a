//! Sensory channels
//!
//! Named sources rendered into fixed-grid panels. Each channel receives a
//! narrow context (memory stats, clock, host-fed notes) instead of
//! reaching into the engine, and the registry enforces the grid:
//! word-wrap, pad, truncate with a trailing ellipsis.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::memory::virtual_memory::MemoryStats;

/// Default panel size (width x height, in characters).
pub const DEFAULT_CHANNEL_SIZE: (usize, usize) = (42, 8);

/// Panel size while a channel is expanded full-screen.
pub const FULLSCREEN_CHANNEL_SIZE: (usize, usize) = (78, 24);

/// What a channel may see.
pub struct ChannelContext<'a> {
    pub stats: &'a MemoryStats,
    pub now: DateTime<Utc>,
    /// Host-fed free text per channel name (tasks, social feed, ...).
    pub notes: &'a HashMap<String, String>,
}

/// A renderable sensory channel.
pub trait SensoryChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Produce raw text; the registry applies the grid.
    fn render(&self, ctx: &ChannelContext<'_>) -> String;
}

/// Word-wrap `text` to `width`, pad every line to exactly `width`, and cut
/// at `height` lines with an ellipsis on overflow.
pub fn render_grid(text: &str, width: usize, height: usize) -> String {
    let width = width.max(4);
    let height = height.max(1);

    let mut lines: Vec<String> = Vec::new();
    for paragraph in text.split('\n') {
        if paragraph.is_empty() {
            lines.push(String::new());
            continue;
        }
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            let mut word = word;
            // Hard-break words wider than the panel.
            while word.chars().count() > width {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                let split: String = word.chars().take(width).collect();
                lines.push(split.clone());
                word = &word[split.len()..];
            }
            let needed = if current.is_empty() {
                word.chars().count()
            } else {
                current.chars().count() + 1 + word.chars().count()
            };
            if needed > width {
                lines.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        lines.push(current);
    }

    let truncated = lines.len() > height;
    lines.truncate(height);
    while lines.len() < height {
        lines.push(String::new());
    }

    let last = lines.len() - 1;
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let mut padded: String = line.chars().take(width).collect();
            if truncated && i == last {
                let keep: String = padded.chars().take(width.saturating_sub(1)).collect();
                padded = format!("{keep}\u{2026}");
            }
            let pad = width.saturating_sub(padded.chars().count());
            padded.extend(std::iter::repeat(' ').take(pad));
            padded
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn usage_bar(used: usize, budget: usize, width: usize) -> String {
    let width = width.max(4);
    let ratio = if budget == 0 {
        0.0
    } else {
        (used as f32 / budget as f32).min(1.0)
    };
    let filled = (ratio * width as f32).round() as usize;
    let mut bar = String::with_capacity(width + 2);
    bar.push('[');
    for i in 0..width {
        bar.push(if i < filled { '#' } else { '-' });
    }
    bar.push(']');
    bar
}

/// Lane usage bars plus working-memory and page-slot totals.
pub struct ContextMapChannel;

impl SensoryChannel for ContextMapChannel {
    fn name(&self) -> &str {
        "context-map"
    }

    fn render(&self, ctx: &ChannelContext<'_>) -> String {
        let stats = ctx.stats;
        let mut out = format!(
            "wm {} {}/{}\n",
            usage_bar(stats.working_memory_used, stats.working_memory_tokens, 10),
            stats.working_memory_used,
            stats.working_memory_tokens
        );
        for lane in &stats.lanes {
            out.push_str(&format!(
                "{:<9} {} {}/{}\n",
                lane.lane.as_str(),
                usage_bar(lane.tokens, lane.budget, 10),
                lane.tokens,
                lane.budget
            ));
        }
        out.push_str(&format!(
            "slot {} {}/{}",
            usage_bar(stats.page_slot_used, stats.page_slot_tokens, 10),
            stats.page_slot_used,
            stats.page_slot_tokens
        ));
        out
    }
}

/// Wall clock and buffer churn.
pub struct TemporalChannel;

impl SensoryChannel for TemporalChannel {
    fn name(&self) -> &str {
        "temporal"
    }

    fn render(&self, ctx: &ChannelContext<'_>) -> String {
        format!(
            "now {}\nbuffer {} messages\npages {} stored / {} loaded",
            ctx.now.format("%Y-%m-%d %H:%M:%S UTC"),
            ctx.stats.buffer_messages,
            ctx.stats.page_count,
            ctx.stats.loaded_pages.len()
        )
    }
}

/// Loaded pages and queue depth: what the agent is currently holding.
pub struct AwarenessChannel;

impl SensoryChannel for AwarenessChannel {
    fn name(&self) -> &str {
        "awareness"
    }

    fn render(&self, ctx: &ChannelContext<'_>) -> String {
        let stats = ctx.stats;
        let mut out = String::new();
        if stats.loaded_pages.is_empty() {
            out.push_str("no pages loaded\n");
        } else {
            for id in &stats.loaded_pages {
                out.push_str(&format!("loaded {}\n", id));
            }
        }
        out.push_str(&format!("{} pages queued for summary", stats.queue_depth));
        out
    }
}

/// Active knobs: model, thinking budget, minimums.
pub struct ConfigChannel;

impl SensoryChannel for ConfigChannel {
    fn name(&self) -> &str {
        "config"
    }

    fn render(&self, ctx: &ChannelContext<'_>) -> String {
        let stats = ctx.stats;
        format!(
            "model {}\nthinking {}\nwm {} tokens, slot {} tokens\nmin recent {}",
            stats.model.as_deref().unwrap_or("-"),
            stats
                .thinking_budget
                .map(|b| format!("{:.2}", b))
                .unwrap_or_else(|| "-".to_string()),
            stats.working_memory_tokens,
            stats.page_slot_tokens,
            stats.min_recent
        )
    }
}

/// Host-fed free-text channel (tasks, social feed, violations, canvas,
/// spend).
pub struct NoteChannel {
    name: &'static str,
    empty_text: &'static str,
}

impl NoteChannel {
    pub fn new(name: &'static str, empty_text: &'static str) -> Self {
        Self { name, empty_text }
    }
}

impl SensoryChannel for NoteChannel {
    fn name(&self) -> &str {
        self.name
    }

    fn render(&self, ctx: &ChannelContext<'_>) -> String {
        ctx.notes
            .get(self.name)
            .cloned()
            .unwrap_or_else(|| self.empty_text.to_string())
    }
}

/// Registry of channels and their panel sizes.
pub struct ChannelRegistry {
    channels: HashMap<String, Box<dyn SensoryChannel>>,
    sizes: HashMap<String, (usize, usize)>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            sizes: HashMap::new(),
        }
    }

    /// Registry with every built-in channel.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ContextMapChannel));
        registry.register(Box::new(TemporalChannel));
        registry.register(Box::new(AwarenessChannel));
        registry.register(Box::new(ConfigChannel));
        registry.register(Box::new(NoteChannel::new("tasks", "no tasks")));
        registry.register(Box::new(NoteChannel::new("social-feed", "feed quiet")));
        registry.register(Box::new(NoteChannel::new("violations", "none")));
        registry.register(Box::new(NoteChannel::new("self-canvas", "blank canvas")));
        registry.register(Box::new(NoteChannel::new("spend", "no spend data")));
        registry
    }

    pub fn register(&mut self, channel: Box<dyn SensoryChannel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_size(&mut self, name: &str, width: usize, height: usize) {
        self.sizes.insert(name.to_string(), (width, height));
    }

    pub fn size_of(&self, name: &str) -> (usize, usize) {
        self.sizes
            .get(name)
            .copied()
            .unwrap_or(DEFAULT_CHANNEL_SIZE)
    }

    /// Render a channel into its grid. Unknown channels come back as
    /// `None`.
    pub fn render(&self, name: &str, ctx: &ChannelContext<'_>) -> Option<String> {
        let channel = self.channels.get(name)?;
        let (width, height) = self.size_of(name);
        Some(render_grid(&channel.render(ctx), width, height))
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
