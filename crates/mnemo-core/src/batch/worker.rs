//! Batch summarization worker
//!
//! A long-lived process that drains the summarization queue into batched
//! completion jobs and writes finished summaries back into page files.
//! It shares nothing with the main process but the filesystem: the queue
//! log, the pages directory, and the OS environment for the API key.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::driver::SUMMARIZER_INSTRUCTION;
use crate::memory::page::Page;
use crate::memory::store::write_json_atomic;
use crate::memory::summarize::{build_summary_prompt, ensure_ref_marker};

use super::queue::SummarizationQueue;

pub const DEFAULT_QUEUE_POLL_SECS: u64 = 60;
pub const DEFAULT_BATCH_POLL_SECS: u64 = 300;
pub const DEFAULT_BATCH_SIZE: usize = 16;

/// Worker configuration. The API key comes from the environment only;
/// argv is visible to `ps`.
#[derive(Debug, Clone)]
pub struct BatchWorkerConfig {
    pub data_dir: PathBuf,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub batch_size: usize,
    pub queue_poll: Duration,
    pub batch_poll: Duration,
}

impl BatchWorkerConfig {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("MNEMO_BATCH_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .context("MNEMO_BATCH_API_KEY (or OPENAI_API_KEY) must be set")?;

        Ok(Self {
            data_dir: std::env::var("MNEMO_DATA_DIR")
                .unwrap_or_else(|_| "./mnemo-data".to_string())
                .into(),
            api_url: std::env::var("MNEMO_BATCH_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key,
            model: std::env::var("MNEMO_BATCH_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            batch_size: std::env::var("MNEMO_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            queue_poll: Duration::from_secs(
                std::env::var("MNEMO_QUEUE_POLL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_QUEUE_POLL_SECS),
            ),
            batch_poll: Duration::from_secs(
                std::env::var("MNEMO_BATCH_POLL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_BATCH_POLL_SECS),
            ),
        })
    }

    fn pages_dir(&self) -> PathBuf {
        self.data_dir.join("pages")
    }

    fn queue_path(&self) -> PathBuf {
        self.data_dir.join("summarization-queue.jsonl")
    }
}

#[derive(Deserialize)]
struct BatchSubmitResponse {
    id: String,
}

#[derive(Deserialize)]
struct BatchStatusResponse {
    status: String,
    #[serde(default)]
    results: Vec<BatchResultItem>,
}

#[derive(Deserialize)]
struct BatchResultItem {
    custom_id: String,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// A submitted batch we are still polling. In-progress ids do not need to
/// survive restarts; the queue on disk does.
struct ActiveBatch {
    id: String,
    page_ids: Vec<String>,
}

/// The worker loop.
pub struct BatchWorker {
    config: BatchWorkerConfig,
    client: reqwest::Client,
    queue: SummarizationQueue,
    active: Vec<ActiveBatch>,
}

impl BatchWorker {
    pub fn new(config: BatchWorkerConfig) -> Result<Self> {
        let queue = SummarizationQueue::open(config.queue_path())
            .context("Failed to open summarization queue")?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            queue,
            active: Vec::new(),
        })
    }

    /// Run until cancelled. Two timers: queue-poll submits pending work,
    /// batch-poll collects finished jobs.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            "Batch worker started: queue poll {:?}, batch poll {:?}, batch size {}",
            self.config.queue_poll, self.config.batch_poll, self.config.batch_size
        );
        let mut queue_tick = tokio::time::interval(self.config.queue_poll);
        let mut batch_tick = tokio::time::interval(self.config.batch_poll);

        loop {
            tokio::select! {
                _ = queue_tick.tick() => {
                    if let Err(e) = self.submit_pending().await {
                        warn!("Queue poll failed: {}", e);
                    }
                }
                _ = batch_tick.tick() => {
                    if let Err(e) = self.poll_batches().await {
                        warn!("Batch poll failed: {}", e);
                    }
                }
            }
        }
    }

    /// Dequeue up to `batch_size` tasks and submit one batch. Submission
    /// failure re-enqueues the tasks.
    pub async fn submit_pending(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let tasks = self.queue.dequeue(self.config.batch_size)?;
        if tasks.is_empty() {
            return Ok(());
        }

        let mut requests = Vec::new();
        let mut page_ids = Vec::new();
        for task in &tasks {
            match self.read_page(&task.page_id) {
                Ok(page) => {
                    requests.push(serde_json::json!({
                        "custom_id": task.page_id,
                        "model": &self.config.model,
                        "system": SUMMARIZER_INSTRUCTION,
                        "prompt": build_summary_prompt(
                            &page.id,
                            &page.label,
                            page.lane,
                            &page.content,
                        ),
                    }));
                    page_ids.push(task.page_id.clone());
                }
                Err(e) => {
                    warn!("Skipping queued page {}: {}", task.page_id, e);
                }
            }
        }
        if requests.is_empty() {
            return Ok(());
        }

        match self.submit_batch(&requests).await {
            Ok(batch_id) => {
                info!("Submitted batch {} with {} pages", batch_id, page_ids.len());
                self.active.push(ActiveBatch {
                    id: batch_id,
                    page_ids,
                });
                Ok(())
            }
            Err(e) => {
                warn!("Batch submission failed, re-enqueueing {} tasks: {}", tasks.len(), e);
                self.queue.requeue_front(tasks)?;
                Ok(())
            }
        }
    }

    async fn submit_batch(&self, requests: &[serde_json::Value]) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/batches", self.config.api_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&serde_json::json!({ "requests": requests }))
            .send()
            .await
            .context("Batch submit request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Batch submit returned status {}", response.status());
        }
        let submitted: BatchSubmitResponse = response
            .json()
            .await
            .context("Batch submit response unreadable")?;
        Ok(submitted.id)
    }

    /// Check every active batch; apply results of ended ones.
    pub async fn poll_batches(&mut self) -> Result<()> {
        let mut still_active = Vec::new();
        let drained: Vec<_> = self.active.drain(..).collect();
        for batch in drained {
            match self.fetch_status(&batch.id).await {
                Ok(status) if status.status == "ended" => {
                    info!("Batch {} ended with {} results", batch.id, status.results.len());
                    self.apply_results(&status.results);
                }
                Ok(status) => {
                    debug!("Batch {} still {}", batch.id, status.status);
                    still_active.push(batch);
                }
                Err(e) => {
                    warn!("Batch {} status check failed: {}", batch.id, e);
                    still_active.push(batch);
                }
            }
        }
        self.active = still_active;
        Ok(())
    }

    async fn fetch_status(&self, batch_id: &str) -> Result<BatchStatusResponse> {
        let response = self
            .client
            .get(format!("{}/batches/{}", self.config.api_url, batch_id))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await
            .context("Batch status request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Batch status returned {}", response.status());
        }
        response
            .json()
            .await
            .context("Batch status response unreadable")
    }

    /// Overwrite page summaries for successful items. Failed items are
    /// logged, not re-enqueued.
    fn apply_results(&self, results: &[BatchResultItem]) {
        for item in results {
            if let Some(error) = &item.error {
                warn!("Batch item {} failed: {}", item.custom_id, error);
                continue;
            }
            let Some(output) = &item.output else {
                warn!("Batch item {} has neither output nor error", item.custom_id);
                continue;
            };
            let summary = ensure_ref_marker(output, &item.custom_id);
            if let Err(e) = self.write_summary(&item.custom_id, &summary) {
                warn!("Failed to write summary for {}: {}", item.custom_id, e);
            } else {
                info!("Wrote batch summary for {}", item.custom_id);
            }
        }
    }

    fn page_path(&self, id: &str) -> PathBuf {
        self.config.pages_dir().join(format!("{}.json", id))
    }

    fn read_page(&self, id: &str) -> Result<Page> {
        let raw = fs::read_to_string(self.page_path(id))
            .with_context(|| format!("Page file missing for {}", id))?;
        serde_json::from_str(&raw).with_context(|| format!("Page file unreadable for {}", id))
    }

    fn write_summary(&self, id: &str, summary: &str) -> Result<()> {
        let mut page = self.read_page(id)?;
        page.summary = Some(summary.to_string());
        write_json_atomic(&self.page_path(id), &page)?;
        Ok(())
    }

    #[cfg(test)]
    fn apply_one(&self, item: BatchResultItem) {
        self.apply_results(&[item]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::queue::QueueEntry;
    use crate::memory::message::{Message, MessageRole};
    use crate::memory::tokens::TokenEstimator;

    fn worker_at(dir: &std::path::Path) -> BatchWorker {
        let config = BatchWorkerConfig {
            data_dir: dir.to_path_buf(),
            api_url: "http://localhost:0".to_string(),
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            batch_size: 4,
            queue_poll: Duration::from_secs(1),
            batch_poll: Duration::from_secs(1),
        };
        BatchWorker::new(config).unwrap()
    }

    fn store_page(dir: &std::path::Path, text: &str) -> Page {
        let est = TokenEstimator::default();
        let page = Page::from_messages(
            MessageRole::Assistant,
            &[Message::assistant(text), Message::assistant("more")],
            &est,
        );
        let pages_dir = dir.join("pages");
        fs::create_dir_all(&pages_dir).unwrap();
        write_json_atomic(&pages_dir.join(format!("{}.json", page.id)), &page).unwrap();
        page
    }

    #[test]
    fn test_apply_result_writes_summary_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let page = store_page(dir.path(), "batch me");
        let worker = worker_at(dir.path());

        worker.apply_one(BatchResultItem {
            custom_id: page.id.clone(),
            output: Some("STATUS: summarized\n- facts".to_string()),
            error: None,
        });

        let updated = worker.read_page(&page.id).unwrap();
        let summary = updated.summary.unwrap();
        assert!(summary.contains("STATUS: summarized"));
        assert!(summary.contains(&format!("@@ref('{}')@@", page.id)));
    }

    #[test]
    fn test_failed_item_leaves_page_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let page = store_page(dir.path(), "fail me");
        let worker = worker_at(dir.path());

        worker.apply_one(BatchResultItem {
            custom_id: page.id.clone(),
            output: None,
            error: Some("model overloaded".to_string()),
        });

        assert!(worker.read_page(&page.id).unwrap().summary.is_none());
    }

    #[tokio::test]
    async fn test_failed_submission_reenqueues() {
        let dir = tempfile::tempdir().unwrap();
        let page = store_page(dir.path(), "requeue me");
        let mut worker = worker_at(dir.path());

        worker
            .queue
            .enqueue(QueueEntry::new(&page.id, &page.label, page.lane))
            .unwrap();
        assert_eq!(worker.queue.size(), 1);

        // The API endpoint is unreachable; the task must survive.
        worker.submit_pending().await.unwrap();
        assert_eq!(worker.queue.size(), 1);
        assert!(worker.active.is_empty());
    }

    #[test]
    fn test_config_rejects_missing_key() {
        // Never read from argv; absent env means a hard error.
        let had = std::env::var("MNEMO_BATCH_API_KEY").ok();
        let had_openai = std::env::var("OPENAI_API_KEY").ok();
        std::env::remove_var("MNEMO_BATCH_API_KEY");
        std::env::remove_var("OPENAI_API_KEY");
        assert!(BatchWorkerConfig::from_env().is_err());
        if let Some(v) = had {
            std::env::set_var("MNEMO_BATCH_API_KEY", v);
        }
        if let Some(v) = had_openai {
            std::env::set_var("OPENAI_API_KEY", v);
        }
    }
}
