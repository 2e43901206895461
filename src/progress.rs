//! Durable crawl progress.
//!
//! [`CrawlProgress`] is the snapshot written to `{stem}_progress.json` next to
//! the dataset; [`ProgressStore`] reads and writes it atomically, and
//! [`ProgressTracker`] is the shared, lock-guarded copy the orchestrator
//! mutates after every finished page.
//!
//! # File format
//!
//! ```json
//! {
//!   "total_pages": 3,
//!   "completed_pages": [1, 2],
//!   "failed_pages": [3],
//!   "total_articles": 20,
//!   "last_update": "2026-10-18T09:12:44Z",
//!   "run_start_time": "2026-10-18T09:10:02Z",
//!   "filters": { "base_url": "...", "keyword": "heart", "page_size": 10 }
//! }
//! ```

use crate::config::FilterParameters;
use crate::error::PersistenceError;
use crate::utils::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub total_pages: u32,
    pub completed_pages: BTreeSet<u32>,
    pub failed_pages: BTreeSet<u32>,
    #[serde(rename = "total_articles")]
    pub total_articles_extracted: u64,
    #[serde(rename = "last_update")]
    pub last_update_timestamp: DateTime<Utc>,
    #[serde(rename = "run_start_time")]
    pub run_started_at: DateTime<Utc>,
    #[serde(rename = "filters")]
    pub filter_parameters: FilterParameters,
}

impl CrawlProgress {
    pub fn new(filters: FilterParameters, total_pages: u32) -> Self {
        let now = Utc::now();
        CrawlProgress {
            total_pages,
            completed_pages: BTreeSet::new(),
            failed_pages: BTreeSet::new(),
            total_articles_extracted: 0,
            last_update_timestamp: now,
            run_started_at: now,
            filter_parameters: filters,
        }
    }

    /// Page reached Done. Removes it from the failed set.
    pub fn mark_done(&mut self, page: u32, articles: u64) {
        self.failed_pages.remove(&page);
        if self.completed_pages.insert(page) {
            self.total_articles_extracted += articles;
        }
        self.last_update_timestamp = Utc::now();
    }

    /// Page reached Failed. A page is never in both sets.
    pub fn mark_failed(&mut self, page: u32) {
        if self.completed_pages.contains(&page) {
            return;
        }
        self.failed_pages.insert(page);
        self.last_update_timestamp = Utc::now();
    }

    /// Pages that reached either terminal state.
    pub fn resolved(&self) -> usize {
        self.completed_pages.len() + self.failed_pages.len()
    }
}

/// Reads and writes the progress file.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ProgressStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last saved snapshot, or `None` when no progress file exists.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<Option<CrawlProgress>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No progress file");
                return Ok(None);
            }
            Err(e) => return Err(PersistenceError::io(&self.path, e)),
        };
        let progress: CrawlProgress =
            serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Json {
                path: self.path.clone(),
                source,
            })?;
        info!(
            total_pages = progress.total_pages,
            completed = progress.completed_pages.len(),
            failed = progress.failed_pages.len(),
            "Loaded progress"
        );
        Ok(Some(progress))
    }

    /// Atomically replace the progress file with `progress`.
    ///
    /// The JSON is written to a sibling temp file, synced, then renamed over
    /// the old file, so a crash leaves either the previous or the new
    /// snapshot and never a torn one.
    ///
    /// # Arguments
    ///
    /// * `progress` - The snapshot to persist
    ///
    /// # Returns
    ///
    /// `Ok(())` once the new file is in place, or a `PersistenceError` if
    /// serialization or the write failed (the old file is then untouched).
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let store = ProgressStore::new(progress_path_for(Path::new("pubs.csv")));
    /// let mut progress = CrawlProgress::new(config.filters(), 12);
    /// progress.mark_done(1, 10);
    /// store.save(&progress).await?;
    /// ```
    pub async fn save(&self, progress: &CrawlProgress) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(progress).map_err(|source| PersistenceError::Json {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))
    }

    /// Delete the progress file. Returns whether one existed.
    pub async fn clear(&self) -> Result<bool, PersistenceError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed progress file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersistenceError::io(&self.path, e)),
        }
    }
}

/// Shared progress with write-through persistence.
///
/// Every mutation happens under the lock and is saved before the lock is
/// released, so the file always matches the last acknowledged change.
#[derive(Debug)]
pub struct ProgressTracker {
    store: ProgressStore,
    state: Mutex<CrawlProgress>,
}

impl ProgressTracker {
    pub fn new(store: ProgressStore, initial: CrawlProgress) -> Self {
        ProgressTracker {
            store,
            state: Mutex::new(initial),
        }
    }

    pub async fn snapshot(&self) -> CrawlProgress {
        self.state.lock().await.clone()
    }

    pub async fn record_done(&self, page: u32, articles: u64) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.mark_done(page, articles);
        self.store.save(&state).await
    }

    pub async fn record_failed(&self, page: u32) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.mark_failed(page);
        self.store.save(&state).await
    }

    /// Save the current state unchanged.
    pub async fn persist(&self) -> Result<(), PersistenceError> {
        let state = self.state.lock().await;
        self.store.save(&state).await
    }
}
