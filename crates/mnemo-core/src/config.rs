//! Configuration
//!
//! All knobs of the paging engine with env-driven construction for
//! binaries and plain defaults for library users and tests.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;

use crate::memory::message::MessageRole;
use crate::memory::tokens::DEFAULT_AVG_CHARS_PER_TOKEN;

/// How page summaries are produced at eviction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    /// Call the driver inline before the page is committed.
    Synchronous,
    /// Write a placeholder summary and enqueue the page for the batch
    /// worker. Trades latency for cost.
    Batched,
}

impl FromStr for SummaryMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sync" | "synchronous" => Ok(SummaryMode::Synchronous),
            "batch" | "batched" => Ok(SummaryMode::Batched),
            _ => Err(anyhow::anyhow!(
                "Invalid summary mode: {}. Must be 'sync' or 'batch'",
                s
            )),
        }
    }
}

/// Per-lane eviction weights. Budgets are split proportionally after
/// normalization, so only the ratios matter.
#[derive(Debug, Clone, Copy)]
pub struct LaneWeights {
    pub assistant: u32,
    pub user: u32,
    pub system: u32,
    pub tool: u32,
}

impl LaneWeights {
    pub fn weight(&self, lane: MessageRole) -> u32 {
        match lane {
            MessageRole::Assistant => self.assistant,
            MessageRole::User => self.user,
            MessageRole::System => self.system,
            MessageRole::Tool => self.tool,
        }
    }

    pub fn total(&self) -> u32 {
        (self.assistant + self.user + self.system + self.tool).max(1)
    }
}

impl Default for LaneWeights {
    fn default() -> Self {
        // Assistant dominant, tool small.
        Self {
            assistant: 8,
            user: 4,
            system: 3,
            tool: 1,
        }
    }
}

/// Paging-engine configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// User data directory; `pages/`, `sessions/` and the summarization
    /// queue live beneath it.
    pub data_dir: PathBuf,
    /// Token budget for recent raw messages in the working window.
    pub working_memory_tokens: usize,
    /// Token budget reserved for loaded pages in the assembled turn.
    pub page_slot_tokens: usize,
    /// Fraction of a lane budget that triggers eviction.
    pub high_ratio: f32,
    /// Most-recent messages each lane always keeps through an eviction.
    pub min_recent: usize,
    pub avg_chars_per_token: f32,
    pub lane_weights: LaneWeights,
    pub summary_mode: SummaryMode,
    /// Cap on pages auto-loaded per turn by semantic fill.
    pub max_auto_fill_pages: usize,
    /// Fraction of the remaining page-slot budget auto-fill may spend.
    pub auto_fill_budget_fraction: f32,
    /// Minimum raw cosine for a search hit to count as relevant.
    pub search_threshold: f32,
    /// Default working-memory usage ratio for `pre_tool_compact`.
    pub pre_tool_compact_threshold: f32,
}

impl MemoryConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            working_memory_tokens: 8_192,
            page_slot_tokens: 4_096,
            high_ratio: 0.75,
            min_recent: 4,
            avg_chars_per_token: DEFAULT_AVG_CHARS_PER_TOKEN,
            lane_weights: LaneWeights::default(),
            summary_mode: SummaryMode::Synchronous,
            max_auto_fill_pages: 3,
            auto_fill_budget_fraction: 0.5,
            search_threshold: 0.35,
            pre_tool_compact_threshold: 0.9,
        }
    }

    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("MNEMO_DATA_DIR").unwrap_or_else(|_| "./mnemo-data".to_string());
        let mut config = Self::new(data_dir);

        if let Ok(v) = std::env::var("MNEMO_WORKING_MEMORY_TOKENS") {
            config.working_memory_tokens = v.parse()?;
        }
        if let Ok(v) = std::env::var("MNEMO_PAGE_SLOT_TOKENS") {
            config.page_slot_tokens = v.parse()?;
        }
        if let Ok(v) = std::env::var("MNEMO_HIGH_RATIO") {
            config.high_ratio = v.parse()?;
        }
        if let Ok(v) = std::env::var("MNEMO_MIN_RECENT") {
            config.min_recent = v.parse()?;
        }
        if let Ok(v) = std::env::var("MNEMO_SUMMARY_MODE") {
            config.summary_mode = v.parse()?;
        }
        if let Ok(v) = std::env::var("MNEMO_MAX_AUTO_FILL_PAGES") {
            config.max_auto_fill_pages = v.parse()?;
        }
        if let Ok(v) = std::env::var("MNEMO_SEARCH_THRESHOLD") {
            config.search_threshold = v.parse()?;
        }

        Ok(config)
    }

    /// Directory holding page files, manifests and indexes.
    pub fn pages_dir(&self) -> PathBuf {
        self.data_dir.join("pages")
    }

    /// Directory holding saved sessions.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// The summarization queue log.
    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("summarization-queue.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MemoryConfig::new("/tmp/x");
        assert_eq!(config.high_ratio, 0.75);
        assert_eq!(config.lane_weights.weight(MessageRole::Assistant), 8);
        assert_eq!(config.lane_weights.weight(MessageRole::Tool), 1);
        assert_eq!(config.lane_weights.total(), 16);
        assert_eq!(config.summary_mode, SummaryMode::Synchronous);
    }

    #[test]
    fn test_paths() {
        let config = MemoryConfig::new("/data");
        assert_eq!(config.pages_dir(), PathBuf::from("/data/pages"));
        assert_eq!(
            config.queue_path(),
            PathBuf::from("/data/summarization-queue.jsonl")
        );
    }

    #[test]
    fn test_summary_mode_parsing() {
        assert_eq!(
            SummaryMode::from_str("batch").unwrap(),
            SummaryMode::Batched
        );
        assert!(SummaryMode::from_str("turbo").is_err());
    }
}
