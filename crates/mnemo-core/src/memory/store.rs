//! Page store
//!
//! Durable, immutable page files plus an index manifest, all under one
//! `pages/` directory. Write ordering is fixed: the page file lands first,
//! then the manifest is replaced via temp file + rename, so a crash
//! mid-write never corrupts the manifest or loses a committed page.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{MemoryError, StoreResult};

use super::page::{Page, PageMeta};

pub const MANIFEST_FILE: &str = "index.json";
pub const LIVE_INDEX_FILE: &str = "embeddings.json";
pub const SHADOW_INDEX_FILE: &str = "embeddings.shadow.json";
pub const SUMMARY_MANIFEST_FILE: &str = "summary-manifest.json";
pub const BATCH_PROGRESS_FILE: &str = "batch-progress.json";

/// The on-disk page manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub pages: Vec<PageMeta>,
    /// Ids currently loaded into the page slot.
    #[serde(default)]
    pub active_page_ids: Vec<String>,
    /// Load order, oldest first; drives page-slot eviction.
    #[serde(default)]
    pub load_order: Vec<String>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

/// Durable store for pages and the manifest.
pub struct PageStore {
    dir: PathBuf,
    manifest: Manifest,
    by_id: HashMap<String, usize>,
}

impl PageStore {
    /// Open (or create) a store at `dir`. A corrupt manifest resets to
    /// empty rather than failing the process.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let manifest_path = dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            match fs::read_to_string(&manifest_path)
                .map_err(MemoryError::from)
                .and_then(|raw| serde_json::from_str::<Manifest>(&raw).map_err(MemoryError::from))
            {
                Ok(m) => m,
                Err(e) => {
                    warn!("Page manifest unreadable, resetting to empty: {}", e);
                    Manifest::default()
                }
            }
        } else {
            Manifest::default()
        };

        let mut store = Self {
            dir,
            manifest,
            by_id: HashMap::new(),
        };
        store.reindex();
        Ok(store)
    }

    fn reindex(&mut self) {
        self.by_id = self
            .manifest
            .pages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn page_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Persist a page, returning whether it was newly stored. Duplicate
    /// writes of the same id are idempotent and never clobber an existing
    /// file (which may already carry a summary written by the batch
    /// worker).
    pub fn write(&mut self, page: &Page) -> StoreResult<bool> {
        if self.by_id.contains_key(&page.id) {
            debug!("Page {} already stored, skipping write", page.id);
            return Ok(false);
        }

        // (1) page file, (2) manifest; never the other way around.
        write_json_atomic(&self.page_path(&page.id), page)?;
        self.manifest.pages.push(PageMeta::from(page));
        self.by_id
            .insert(page.id.clone(), self.manifest.pages.len() - 1);
        self.save_manifest()?;
        info!(
            "Stored page {} ({}, {} messages, {} tokens)",
            page.id, page.label, page.message_count, page.tokens
        );
        Ok(true)
    }

    /// Load a page from disk. Reads the file fresh on every call so
    /// summary updates from the batch worker are visible immediately.
    pub fn read(&self, id: &str) -> StoreResult<Page> {
        if !self.by_id.contains_key(id) {
            return Err(MemoryError::PageNotFound(id.to_string()));
        }
        let path = self.page_path(id);
        if !path.exists() {
            return Err(MemoryError::PageFileMissing(path));
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Replace a page's summary in place.
    pub fn update_summary(&mut self, id: &str, summary: &str) -> StoreResult<()> {
        let mut page = self.read(id)?;
        page.summary = Some(summary.to_string());
        write_json_atomic(&self.page_path(id), &page)?;
        Ok(())
    }

    pub fn has_page(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn meta(&self, id: &str) -> Option<&PageMeta> {
        self.by_id.get(id).map(|&i| &self.manifest.pages[i])
    }

    pub fn list(&self) -> &[PageMeta] {
        &self.manifest.pages
    }

    pub fn page_count(&self) -> usize {
        self.manifest.pages.len()
    }

    pub fn active_page_ids(&self) -> &[String] {
        &self.manifest.active_page_ids
    }

    pub fn load_order(&self) -> &[String] {
        &self.manifest.load_order
    }

    /// Replace the loaded-set state and persist the manifest.
    pub fn set_runtime_state(
        &mut self,
        active: Vec<String>,
        load_order: Vec<String>,
    ) -> StoreResult<()> {
        self.manifest.active_page_ids = active;
        self.manifest.load_order = load_order;
        self.save_manifest()
    }

    pub fn save_manifest(&mut self) -> StoreResult<()> {
        self.manifest.saved_at = Some(Utc::now());
        write_json_atomic(&self.dir.join(MANIFEST_FILE), &self.manifest)
    }

    /// Re-read the manifest from disk, dropping in-memory state.
    pub fn reload_manifest(&mut self) -> StoreResult<()> {
        let path = self.dir.join(MANIFEST_FILE);
        self.manifest = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            Manifest::default()
        };
        self.reindex();
        Ok(())
    }

    /// Scan the pages directory for page files, manifest notwithstanding.
    /// The batch rebuild walks this rather than the manifest so pages from
    /// other processes are covered.
    pub fn scan_page_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
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

    pub fn live_index_path(&self) -> PathBuf {
        self.dir.join(LIVE_INDEX_FILE)
    }

    pub fn shadow_index_path(&self) -> PathBuf {
        self.dir.join(SHADOW_INDEX_FILE)
    }

    pub fn summary_manifest_path(&self) -> PathBuf {
        self.dir.join(SUMMARY_MANIFEST_FILE)
    }

    pub fn batch_progress_path(&self) -> PathBuf {
        self.dir.join(BATCH_PROGRESS_FILE)
    }

    /// Complete an index swap that crashed between the shadow write and the
    /// rename: a shadow with no in-progress marker means the rebuild
    /// finished and only the publish step was lost.
    pub fn recover_orphaned_shadow(&self) -> StoreResult<bool> {
        recover_orphaned_shadow(
            &self.live_index_path(),
            &self.shadow_index_path(),
            &self.batch_progress_path(),
        )
    }
}

/// See [`PageStore::recover_orphaned_shadow`].
pub fn recover_orphaned_shadow(
    live_path: &Path,
    shadow_path: &Path,
    progress_path: &Path,
) -> StoreResult<bool> {
    if shadow_path.exists() && !progress_path.exists() {
        info!(
            "Recovering orphaned shadow index: {} -> {}",
            shadow_path.display(),
            live_path.display()
        );
        fs::rename(shadow_path, live_path)?;
        return Ok(true);
    }
    Ok(false)
}

/// Serialize to a temp file beside `path`, then rename into place. POSIX
/// rename is atomic within one directory.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
