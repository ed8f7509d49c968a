//! Mnemo Core Library
//!
//! An agent-runtime context manager: a paged virtual-memory layer for
//! conversational messages, with semantic retrieval over evicted pages
//! and a sensory buffer that lets the agent perceive its own memory
//! state.

pub mod batch;
pub mod config;
pub mod driver;
pub mod embedding;
pub mod error;
pub mod index;
pub mod markers;
pub mod memory;
pub mod retrieval;
pub mod sensory;

// Re-export key types for convenience
pub use batch::{BatchSummarizer, BatchWorker, BatchWorkerConfig, SummarizationQueue};
pub use config::{LaneWeights, MemoryConfig, SummaryMode};
pub use driver::{ChatDriver, SUMMARIZER_INSTRUCTION};
pub use embedding::{EmbeddingFactory, EmbeddingProvider};
pub use error::MemoryError;
pub use index::{PageSearchIndex, RefBoost, SearchHit};
pub use markers::Marker;
pub use memory::{
    AgentMemory, CompactionHints, MemoryStats, Message, MessageRole, Page, PageStore,
    VirtualMemory,
};
pub use retrieval::SemanticRetrieval;
pub use sensory::SensoryMemory;
