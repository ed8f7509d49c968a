//! Batch rebuild of summaries and the search index
//!
//! Re-summarizes every page with the current model and rebuilds the index
//! into a shadow file, then publishes atomically. The run is
//! interruptible (cancel flag), resumable (progress file), yield-aware
//! (host-supplied gate) and crash-safe (orphaned shadows are recovered on
//! startup).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::driver::ChatDriver;
use crate::index::PageSearchIndex;
use crate::memory::page::{content_prefix_hash, Page};
use crate::memory::store::{write_json_atomic, PageStore};
use crate::memory::summarize::summarize_content;
use crate::retrieval::SemanticRetrieval;

/// Progress flushes happen every this many summarized pages.
const FLUSH_EVERY: usize = 10;

/// Host-supplied gate letting the rebuild yield to interactive turns.
#[async_trait::async_trait]
pub trait YieldGate: Send + Sync {
    /// An interactive turn is pending; the rebuild should pause.
    fn should_yield(&self) -> bool;

    /// Await until the host is idle again.
    async fn wait_for_idle(&self);
}

/// Gate that never yields; the default for batch contexts.
pub struct NeverYield;

#[async_trait::async_trait]
impl YieldGate for NeverYield {
    fn should_yield(&self) -> bool {
        false
    }

    async fn wait_for_idle(&self) {}
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchProgress {
    version: u32,
    started_at: DateTime<Utc>,
    completed_page_ids: Vec<String>,
    failed_page_ids: Vec<String>,
    shadow_index_path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SummaryManifest {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    hashes: HashMap<String, String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl SummaryManifest {
    fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }
}

/// Outcome of a rebuild run.
#[derive(Debug, Default)]
pub struct RebuildReport {
    pub summarized: usize,
    pub skipped: usize,
    pub failed: usize,
    pub refreshed: usize,
    pub cancelled: bool,
}

/// Double-buffered rebuild of all page summaries plus a shadow index,
/// atomically swapped into place on completion.
pub struct BatchSummarizer {
    pages_dir: PathBuf,
    driver: Arc<dyn ChatDriver>,
    gate: Arc<dyn YieldGate>,
    force: bool,
    cancel: Arc<AtomicBool>,
}

impl BatchSummarizer {
    pub fn new(store: &PageStore, driver: Arc<dyn ChatDriver>) -> Self {
        Self {
            pages_dir: store.dir().to_path_buf(),
            driver,
            gate: Arc::new(NeverYield),
            force: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Re-summarize even pages whose content hash is unchanged.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_yield_gate(mut self, gate: Arc<dyn YieldGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Shared flag checked at each page boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn live_path(&self) -> PathBuf {
        self.pages_dir.join(crate::memory::store::LIVE_INDEX_FILE)
    }

    fn shadow_path(&self) -> PathBuf {
        self.pages_dir.join(crate::memory::store::SHADOW_INDEX_FILE)
    }

    fn progress_path(&self) -> PathBuf {
        self.pages_dir.join(crate::memory::store::BATCH_PROGRESS_FILE)
    }

    fn manifest_path(&self) -> PathBuf {
        self.pages_dir
            .join(crate::memory::store::SUMMARY_MANIFEST_FILE)
    }

    fn page_path(&self, id: &str) -> PathBuf {
        self.pages_dir.join(format!("{}.json", id))
    }

    fn read_page(&self, id: &str) -> Result<Page> {
        let raw = fs::read_to_string(self.page_path(id))
            .with_context(|| format!("Failed to read page {}", id))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse page {}", id))
    }

    fn page_mtime(&self, id: &str) -> Option<SystemTime> {
        fs::metadata(self.page_path(id))
            .and_then(|m| m.modified())
            .ok()
    }

    fn scan_page_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.pages_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if stem.starts_with("pg_") {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Run the rebuild. Holds the retrieval layer's `batch_running` mutex
    /// for the duration; returns early if another rebuild owns it.
    pub async fn run(&self, retrieval: &mut SemanticRetrieval) -> Result<RebuildReport> {
        if retrieval.is_batch_running() {
            anyhow::bail!("Batch rebuild already in progress");
        }
        retrieval.set_batch_running(true);
        let result = self.run_inner(retrieval).await;
        retrieval.set_batch_running(false);
        result
    }

    async fn run_inner(&self, retrieval: &mut SemanticRetrieval) -> Result<RebuildReport> {
        let started_wall = SystemTime::now();

        // Load or start the progress file.
        let progress_path = self.progress_path();
        let mut progress = if progress_path.exists() {
            match fs::read_to_string(&progress_path)
                .ok()
                .and_then(|raw| serde_json::from_str::<BatchProgress>(&raw).ok())
            {
                Some(progress) => {
                    info!(
                        "Resuming batch rebuild: {} completed, {} failed",
                        progress.completed_page_ids.len(),
                        progress.failed_page_ids.len()
                    );
                    progress
                }
                None => {
                    warn!("Batch progress unreadable, starting fresh");
                    self.fresh_progress()
                }
            }
        } else {
            self.fresh_progress()
        };

        // Shadow index: load any half-built shadow when resuming.
        let mut shadow = PageSearchIndex::new(self.shadow_path(), retrieval.embedder());
        if self.shadow_path().exists() {
            shadow.load().context("Failed to load shadow index")?;
        }

        let mut manifest = SummaryManifest::load(&self.manifest_path());
        let mut written_mtimes: HashMap<String, SystemTime> = HashMap::new();
        let mut report = RebuildReport::default();
        let mut completed: std::collections::HashSet<String> =
            progress.completed_page_ids.iter().cloned().collect();
        let mut since_flush = 0usize;

        let page_ids = self.scan_page_ids()?;
        info!("Batch rebuild covering {} pages", page_ids.len());

        for id in &page_ids {
            if completed.contains(id) {
                continue;
            }
            if self.is_cancelled() {
                info!("Batch rebuild cancelled, flushing progress");
                self.flush(&progress, &shadow, &manifest)?;
                report.cancelled = true;
                return Ok(report);
            }
            if self.gate.should_yield() {
                debug!("Yielding batch rebuild to interactive turn");
                self.flush(&progress, &shadow, &manifest)?;
                self.gate.wait_for_idle().await;
            }

            let page = match self.read_page(id) {
                Ok(page) => page,
                Err(e) => {
                    warn!("Batch rebuild failed to load {}: {}", id, e);
                    progress.failed_page_ids.push(id.clone());
                    report.failed += 1;
                    continue;
                }
            };

            let hash = content_prefix_hash(&page.content);
            let unchanged = !self.force
                && manifest.hashes.get(id).map(String::as_str) == Some(hash.as_str())
                && page.summary.is_some();

            if unchanged {
                // Reuse the existing summary; only the embedding moves to
                // the shadow.
                let summary = page.summary.clone().unwrap_or_default();
                shadow.index_page(id, &summary, &page.label).await;
                report.skipped += 1;
            } else {
                let summary = summarize_content(
                    self.driver.as_ref(),
                    &page.id,
                    &page.label,
                    page.lane,
                    &page.content,
                    page.message_count,
                )
                .await;
                let mut updated = page.clone();
                updated.summary = Some(summary.clone());
                write_json_atomic(&self.page_path(id), &updated)
                    .with_context(|| format!("Failed to write summary for {}", id))?;
                if let Some(mtime) = self.page_mtime(id) {
                    written_mtimes.insert(id.clone(), mtime);
                }
                shadow.index_page(id, &summary, &page.label).await;
                manifest.hashes.insert(id.clone(), hash);
                report.summarized += 1;
                since_flush += 1;
            }

            completed.insert(id.clone());
            progress.completed_page_ids.push(id.clone());

            if since_flush >= FLUSH_EVERY {
                since_flush = 0;
                self.flush(&progress, &shadow, &manifest)?;
            }
        }

        if self.is_cancelled() {
            self.flush(&progress, &shadow, &manifest)?;
            report.cancelled = true;
            return Ok(report);
        }

        // Freshness check: catch pages modified behind our back during
        // the rebuild.
        for id in progress.completed_page_ids.clone() {
            let Some(current) = self.page_mtime(&id) else {
                continue;
            };
            let reference = written_mtimes.get(&id).copied().unwrap_or(started_wall);
            if current <= reference {
                continue;
            }
            debug!("Freshness check: {} changed during rebuild", id);
            let page = match self.read_page(&id) {
                Ok(page) => page,
                Err(e) => {
                    warn!("Freshness check cannot reload {}: {}", id, e);
                    continue;
                }
            };
            let summary = summarize_content(
                self.driver.as_ref(),
                &page.id,
                &page.label,
                page.lane,
                &page.content,
                page.message_count,
            )
            .await;
            let mut updated = page.clone();
            updated.summary = Some(summary.clone());
            if let Err(e) = write_json_atomic(&self.page_path(&id), &updated) {
                warn!("Freshness write failed for {}, skipping this cycle: {}", id, e);
                continue;
            }
            shadow.index_page(&id, &summary, &page.label).await;
            manifest.hashes.insert(id.clone(), content_prefix_hash(&page.content));
            report.refreshed += 1;
        }

        // Atomic swap: (i) shadow hits disk, (ii) in-memory swap with the
        // path already pointing at the live file, (iii) rename publishes
        // the file. No query may cross this boundary.
        shadow.save().context("Failed to write shadow index")?;
        shadow.set_index_path(self.live_path());
        retrieval.swap_index(shadow);
        if let Err(e) = fs::rename(self.shadow_path(), self.live_path()) {
            // Cross-device fallback: write the live file directly.
            warn!("Shadow rename failed ({}), writing live index directly", e);
            retrieval
                .index()
                .save()
                .context("Failed to write live index after rename failure")?;
            let _ = fs::remove_file(self.shadow_path());
        }

        manifest.version = 1;
        manifest.updated_at = Some(Utc::now());
        write_json_atomic(&self.manifest_path(), &manifest)
            .context("Failed to write summary manifest")?;
        fs::remove_file(&progress_path).ok();

        info!(
            "Batch rebuild done: {} summarized, {} skipped, {} failed, {} refreshed",
            report.summarized, report.skipped, report.failed, report.refreshed
        );
        Ok(report)
    }

    fn fresh_progress(&self) -> BatchProgress {
        BatchProgress {
            version: 1,
            started_at: Utc::now(),
            completed_page_ids: Vec::new(),
            failed_page_ids: Vec::new(),
            shadow_index_path: self.shadow_path(),
        }
    }

    fn flush(
        &self,
        progress: &BatchProgress,
        shadow: &PageSearchIndex,
        manifest: &SummaryManifest,
    ) -> Result<()> {
        write_json_atomic(&self.progress_path(), progress)
            .context("Failed to flush batch progress")?;
        shadow.save().context("Failed to flush shadow index")?;
        write_json_atomic(&self.manifest_path(), manifest)
            .context("Failed to flush summary manifest")?;
        Ok(())
    }
}
