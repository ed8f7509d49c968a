//! Storage-layer error types
//!
//! The paging engine and orchestrators use `anyhow` at their seams; the
//! store and queue return typed errors so callers can distinguish a missing
//! page from a corrupt manifest.

use std::path::PathBuf;

/// Errors produced by the page store and the summarization queue.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("page {0} not found")]
    PageNotFound(String),

    #[error("page file missing on disk: {0}")]
    PageFileMissing(PathBuf),

    #[error("manifest unreadable at {path}: {reason}")]
    CorruptManifest { path: PathBuf, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, MemoryError>;
