//! Asynchronous summarization
//!
//! The persistent queue, the out-of-process batch worker, and the
//! in-process batch rebuild. The pages directory is the only coordination
//! surface between the worker and the main process.

pub mod queue;
pub mod summarizer;
pub mod worker;

pub use queue::{QueueEntry, SummarizationQueue};
pub use summarizer::{BatchSummarizer, NeverYield, RebuildReport, YieldGate};
pub use worker::{BatchWorker, BatchWorkerConfig};
