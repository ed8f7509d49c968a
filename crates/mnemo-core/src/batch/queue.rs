//! Summarization queue
//!
//! Persistent FIFO of pages awaiting asynchronous summarization. The log
//! is append-only newline-delimited JSON; dequeues rewrite the remainder
//! so enqueued items survive process restarts.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreResult;
use crate::memory::message::MessageRole;

/// One page awaiting summarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub page_id: String,
    pub label: String,
    pub lane: MessageRole,
    pub queued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(page_id: impl Into<String>, label: impl Into<String>, lane: MessageRole) -> Self {
        Self {
            page_id: page_id.into(),
            label: label.into(),
            lane,
            queued_at: Utc::now(),
        }
    }
}

/// Persistent FIFO backed by a JSONL log.
pub struct SummarizationQueue {
    path: PathBuf,
    entries: VecDeque<QueueEntry>,
}

impl SummarizationQueue {
    /// Open the queue, loading any surviving entries. Unparseable lines
    /// are skipped with a warning.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entries = VecDeque::new();
        if path.exists() {
            for line in fs::read_to_string(&path)?.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<QueueEntry>(line) {
                    Ok(entry) => entries.push_back(entry),
                    Err(e) => warn!("Skipping unparseable queue line: {}", e),
                }
            }
        }

        Ok(Self { path, entries })
    }

    /// Append an entry to the log and the in-memory tail.
    pub fn enqueue(&mut self, entry: QueueEntry) -> StoreResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        self.entries.push_back(entry);
        Ok(())
    }

    /// Remove and return up to `n` entries in FIFO order, persisting the
    /// remainder.
    pub fn dequeue(&mut self, n: usize) -> StoreResult<Vec<QueueEntry>> {
        let take = n.min(self.entries.len());
        let taken: Vec<QueueEntry> = self.entries.drain(..take).collect();
        if !taken.is_empty() {
            self.rewrite()?;
        }
        Ok(taken)
    }

    /// Put entries back at the head, preserving FIFO order. Used when a
    /// batch submission fails.
    pub fn requeue_front(&mut self, items: Vec<QueueEntry>) -> StoreResult<()> {
        for entry in items.into_iter().rev() {
            self.entries.push_front(entry);
        }
        self.rewrite()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) -> StoreResult<()> {
        self.entries.clear();
        self.rewrite()
    }

    fn rewrite(&self) -> StoreResult<()> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, out)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> QueueEntry {
        QueueEntry::new(id, format!("label-{id}"), MessageRole::Assistant)
    }

    #[test]
    fn test_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = SummarizationQueue::open(dir.path().join("q.jsonl")).unwrap();

        queue.enqueue(entry("pg_1")).unwrap();
        queue.enqueue(entry("pg_2")).unwrap();
        queue.enqueue(entry("pg_3")).unwrap();

        let taken = queue.dequeue(2).unwrap();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].page_id, "pg_1");
        assert_eq!(taken[1].page_id, "pg_2");
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.jsonl");
        {
            let mut queue = SummarizationQueue::open(&path).unwrap();
            queue.enqueue(entry("pg_a")).unwrap();
            queue.enqueue(entry("pg_b")).unwrap();
            queue.dequeue(1).unwrap();
        }
        let queue = SummarizationQueue::open(&path).unwrap();
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = SummarizationQueue::open(dir.path().join("q.jsonl")).unwrap();
        for id in ["pg_1", "pg_2", "pg_3"] {
            queue.enqueue(entry(id)).unwrap();
        }
        let taken = queue.dequeue(2).unwrap();
        queue.requeue_front(taken).unwrap();

        let all = queue.dequeue(3).unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.page_id.as_str()).collect();
        assert_eq!(ids, ["pg_1", "pg_2", "pg_3"]);
    }

    #[test]
    fn test_bad_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.jsonl");
        let good = serde_json::to_string(&entry("pg_ok")).unwrap();
        fs::write(&path, format!("{good}\nnot json\n")).unwrap();

        let queue = SummarizationQueue::open(&path).unwrap();
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.jsonl");
        let mut queue = SummarizationQueue::open(&path).unwrap();
        queue.enqueue(entry("pg_1")).unwrap();
        queue.clear().unwrap();
        assert!(queue.is_empty());
        assert_eq!(SummarizationQueue::open(&path).unwrap().size(), 0);
    }
}
