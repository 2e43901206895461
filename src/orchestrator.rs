//! Crawl orchestration.
//!
//! One [`Orchestrator::run`] discovers the page count, plans the pages still
//! owed from stored progress, sweeps them with two levels of bounded
//! concurrency (pages, then the articles of each page) and finishes with a
//! compensation pass over failed pages and incomplete records.
//!
//! Cancellation is cooperative. The token is checked before each page or
//! record is submitted; work already submitted runs to its terminal state.
//! A run counts as cancelled only when the token held work back.

use crate::config::CrawlConfig;
use crate::error::{CrawlError, FetchError, PersistenceError};
use crate::extractor::Extractor;
use crate::fetcher::{FetchTarget, Fetcher, SessionRegistry};
use crate::models::{
    ArticleDetail, ArticleRecord, CrawlSummary, ListingEntry, UnitState, WorkUnit,
};
use crate::progress::{CrawlProgress, ProgressStore, ProgressTracker};
use crate::store::DatasetStore;
use crate::utils::truncate_for_log;
use futures::future::ready;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Pages to submit, failed pages first, then never-attempted pages in
/// ascending order. Completed pages are never included.
pub fn plan_pending_units(total_pages: u32, progress: &CrawlProgress) -> Vec<u32> {
    let in_range = |p: &u32| (1..=total_pages).contains(p);
    let failed = progress.failed_pages.iter().copied().filter(in_range);
    let fresh = (1..=total_pages).filter(|p| {
        !progress.completed_pages.contains(p) && !progress.failed_pages.contains(p)
    });
    failed.chain(fresh).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetailOutcome {
    Fetched,
    NotFound,
    Failed,
}

/// Counts of detail fetch outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetailTally {
    /// Detail page fetched and an abstract found.
    pub fetched: usize,
    /// Detail page fetched without an abstract section.
    pub not_found: usize,
    pub failed: usize,
}

impl DetailTally {
    fn record(&mut self, outcome: DetailOutcome) {
        match outcome {
            DetailOutcome::Fetched => self.fetched += 1,
            DetailOutcome::NotFound => self.not_found += 1,
            DetailOutcome::Failed => self.failed += 1,
        }
    }

    /// Records whose detail fetch produced content.
    pub fn completed(&self) -> usize {
        self.fetched + self.not_found
    }

    /// Records that were submitted at all.
    pub fn attempted(&self) -> usize {
        self.fetched + self.not_found + self.failed
    }
}

#[derive(Debug, Default)]
struct PageReport {
    articles: usize,
    details: DetailTally,
}

/// What `probe` saw on the live site.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub total_pages: u32,
    pub first_entry: Option<ListingEntry>,
    pub detail: Option<ArticleDetail>,
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total pages:    {}", self.total_pages)?;
        let Some(entry) = &self.first_entry else {
            return write!(f, "First entry:    (listing page 1 is empty)");
        };
        writeln!(f, "First entry:    {}", truncate_for_log(&entry.title, 100))?;
        writeln!(f, "  link:         {}", entry.link)?;
        writeln!(f, "  authors:      {}", truncate_for_log(&entry.authors, 100))?;
        writeln!(f, "  journal:      {}", entry.journal)?;
        writeln!(f, "  disease areas: {}", entry.disease_areas.join("; "))?;
        match &self.detail {
            Some(detail) => {
                writeln!(f, "  publish date: {}", detail.publish_date)?;
                writeln!(f, "  PubMed ID:    {}", detail.pubmed_id)?;
                writeln!(f, "  DOI:          {}", detail.doi)?;
                write!(
                    f,
                    "  abstract:     {}",
                    truncate_for_log(detail.abstract_text.as_str(), 200)
                )
            }
            None => write!(f, "  detail:       (not fetched)"),
        }
    }
}

#[derive(Debug, Default)]
struct UnitBook {
    units: BTreeMap<u32, WorkUnit>,
    attempted: BTreeSet<u32>,
}

/// Drives a crawl against one dataset and its progress file.
pub struct Orchestrator {
    config: CrawlConfig,
    sessions: Arc<SessionRegistry>,
    extractor: Arc<dyn Extractor>,
    dataset: Arc<DatasetStore>,
    progress_store: ProgressStore,
    cancel: CancellationToken,
    book: Mutex<UnitBook>,
}

impl Orchestrator {
    pub fn new(
        config: CrawlConfig,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn Extractor>,
        dataset: Arc<DatasetStore>,
        progress_store: ProgressStore,
    ) -> Self {
        Orchestrator {
            config,
            sessions: Arc::new(SessionRegistry::new(fetcher)),
            extractor,
            dataset,
            progress_store,
            cancel: CancellationToken::new(),
            book: Mutex::new(UnitBook::default()),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn dataset(&self) -> &DatasetStore {
        &self.dataset
    }

    /// Stop submitting new work. In-flight pages finish normally.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            warn!("Cancellation requested; no new pages will be submitted");
        }
        self.cancel.cancel();
    }

    /// Token shared with signal handlers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current state of `page` in this run, if it was planned.
    pub fn unit_state(&self, page: u32) -> Option<UnitState> {
        let book = self.book.lock().ok()?;
        book.units.get(&page).map(|u| u.state)
    }

    /// Query listing page 1 and derive `ceil(total_results / page_size)`.
    #[instrument(level = "info", skip_all)]
    pub async fn discover_total_pages(&self) -> Result<u32, CrawlError> {
        let raw = self
            .fetch(FetchTarget::ListingPage { page: 1 })
            .await
            .map_err(|e| CrawlError::Discovery(e.to_string()))?;
        let total_results = self.extractor.extract_total_results(&raw).ok_or_else(|| {
            CrawlError::Discovery(format!(
                "listing page 1 states no result count: {}",
                truncate_for_log(raw.trim(), 120)
            ))
        })?;
        let pages = total_results.div_ceil(u64::from(self.config.page_size));
        let total_pages = u32::try_from(pages).map_err(|_| {
            CrawlError::Discovery(format!("{total_results} results exceed the page range"))
        })?;
        info!(
            total_results,
            total_pages,
            page_size = self.config.page_size,
            "Discovered listing size"
        );
        Ok(total_pages)
    }

    /// Crawl every pending page with at most `concurrency_limit` pages in
    /// flight, then compensate.
    ///
    /// Progress already on disk is resumed. Per-page failures end up in the
    /// summary; only discovery, configuration and persistence errors are
    /// returned as `Err`.
    ///
    /// # Arguments
    ///
    /// * `concurrency_limit` - Listing pages in flight at once (0 is treated as 1)
    ///
    /// # Returns
    ///
    /// A [`CrawlSummary`] of the run. `summary.cancelled` is set only when the
    /// token kept a page or record from being submitted, so a cancellation
    /// that arrives during the last page still yields a complete summary.
    ///
    /// # Errors
    ///
    /// * `CrawlError::FilterMismatch` - stored progress belongs to another query
    /// * `CrawlError::Discovery` - no page count and none stored
    /// * `CrawlError::Persistence` - the progress file or dataset could not be written
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let summary = orchestrator.run(3).await?;
    /// if !summary.is_complete() {
    ///     eprintln!("rerun with --resume: {:?}", summary.pending_pages);
    /// }
    /// ```
    #[instrument(level = "info", skip_all, fields(page_concurrency = concurrency_limit))]
    pub async fn run(&self, concurrency_limit: usize) -> Result<CrawlSummary, CrawlError> {
        let t0 = Instant::now();
        let filters = self.config.filters();
        let stored = self.progress_store.load().await?;
        if let Some(stored) = &stored {
            if stored.filter_parameters != filters {
                return Err(CrawlError::FilterMismatch {
                    stored: stored.filter_parameters.to_string(),
                    current: filters.to_string(),
                });
            }
        }

        let total_pages = match (self.discover_total_pages().await, &stored) {
            (Ok(pages), _) => pages,
            (Err(e), Some(stored)) if stored.total_pages > 0 => {
                warn!(
                    error = %e,
                    total_pages = stored.total_pages,
                    "Discovery failed; continuing with the stored page count"
                );
                stored.total_pages
            }
            (Err(e), _) => return Err(e),
        };

        let initial = match stored {
            Some(mut progress) => {
                if progress.total_pages != total_pages {
                    info!(
                        stored = progress.total_pages,
                        discovered = total_pages,
                        "Page count changed since the last run"
                    );
                    progress.total_pages = total_pages;
                }
                progress
            }
            None => CrawlProgress::new(filters, total_pages),
        };
        let tracker = ProgressTracker::new(self.progress_store.clone(), initial);
        tracker.persist().await?;

        let snapshot = tracker.snapshot().await;
        let pending = plan_pending_units(total_pages, &snapshot);
        info!(
            total_pages,
            completed = snapshot.completed_pages.len(),
            failed = snapshot.failed_pages.len(),
            pending = pending.len(),
            "Planned crawl"
        );
        self.register(&pending);

        let mut summary = CrawlSummary {
            total_pages,
            ..Default::default()
        };
        self.sweep(
            &pending,
            concurrency_limit,
            self.config.article_concurrency,
            &tracker,
            &mut summary,
        )
        .await?;

        self.compensate(&tracker, &mut summary).await?;

        // Every submitted unit has drained by now.
        self.sessions.release_all().await;
        tracker.persist().await?;
        self.finish_summary(&tracker, &mut summary, t0).await;
        info!(
            succeeded = summary.pages_succeeded,
            failed = summary.failed_pages.len(),
            pending = summary.pending_pages.len(),
            cancelled = summary.cancelled,
            elapsed_ms = summary.elapsed.as_millis(),
            "Crawl finished"
        );
        Ok(summary)
    }

    /// Re-fetch details for every record without a usable abstract.
    #[instrument(level = "info", skip_all)]
    pub async fn retry_missing_abstracts(&self) -> Result<DetailTally, CrawlError> {
        let targets = self.dataset.with_missing_abstract().await;
        info!(records = targets.len(), "Retrying records without an abstract");
        let tally = self
            .complete_all(targets, self.config.compensation_concurrency)
            .await?;
        self.sessions.release_all().await;
        info!(
            fetched = tally.fetched,
            not_found = tally.not_found,
            failed = tally.failed,
            "Abstract retry finished"
        );
        Ok(tally)
    }

    /// Fetch page 1 and the first article without touching either store.
    #[instrument(level = "info", skip_all)]
    pub async fn probe(&self) -> Result<ProbeReport, CrawlError> {
        let total_pages = self.discover_total_pages().await?;
        let raw = self.fetch(FetchTarget::ListingPage { page: 1 }).await?;
        let first_entry = self.extractor.extract_listing(&raw)?.into_iter().next();
        let detail = match &first_entry {
            Some(entry) => {
                let raw = self
                    .fetch(FetchTarget::Article {
                        url: entry.link.clone(),
                    })
                    .await?;
                Some(self.extractor.extract_detail(&raw))
            }
            None => None,
        };
        self.sessions.release_all().await;
        Ok(ProbeReport {
            total_pages,
            first_entry,
            detail,
        })
    }

    /// Fetch `target` on an exclusive session with the configured retries.
    async fn fetch(&self, target: FetchTarget) -> Result<String, FetchError> {
        let policy = &self.config.retry;
        let label = target.to_string();
        self.sessions
            .with_session(|session| async move {
                policy.run(&label, || session.fetch(&target)).await
            })
            .await
    }

    async fn sweep(
        &self,
        pages: &[u32],
        page_limit: usize,
        article_limit: usize,
        tracker: &ProgressTracker,
        summary: &mut CrawlSummary,
    ) -> Result<(), CrawlError> {
        let token = self.cancel.clone();
        let mut results = pin!(
            stream::iter(pages.iter().copied())
                .take_while(move |_| ready(!token.is_cancelled()))
                .map(|page| self.process_page(page, article_limit, tracker))
                .buffer_unordered(page_limit.max(1))
        );

        // Each submitted page yields exactly one result.
        let mut drained = 0;
        while let Some(result) = results.next().await {
            drained += 1;
            if let Some(report) = result? {
                summary.articles_extracted += report.articles as u64;
            }
        }
        if drained < pages.len() {
            summary.cancelled = true;
            info!(
                submitted = drained,
                held_back = pages.len() - drained,
                "In-flight pages drained after cancellation"
            );
        }
        Ok(())
    }

    /// Run one page to a terminal state. Only persistence errors escape.
    #[instrument(level = "info", skip_all, fields(page = page))]
    async fn process_page(
        &self,
        page: u32,
        article_limit: usize,
        tracker: &ProgressTracker,
    ) -> Result<Option<PageReport>, CrawlError> {
        self.transition(page, UnitState::InProgress);
        match self.crawl_page(page, article_limit).await {
            Ok(report) => {
                tracker.record_done(page, report.articles as u64).await?;
                self.transition(page, UnitState::Done);
                info!(
                    articles = report.articles,
                    details_fetched = report.details.fetched,
                    abstracts_not_found = report.details.not_found,
                    details_failed = report.details.failed,
                    "Page done"
                );
                Ok(Some(report))
            }
            Err(CrawlError::Persistence(e)) => {
                error!(error = %e, "Store write failed; aborting run");
                Err(e.into())
            }
            Err(e) => {
                warn!(error = %e, "Page failed");
                tracker.record_failed(page).await?;
                self.transition(page, UnitState::Failed);
                Ok(None)
            }
        }
    }

    async fn crawl_page(&self, page: u32, article_limit: usize) -> Result<PageReport, CrawlError> {
        let raw = self.fetch(FetchTarget::ListingPage { page }).await?;
        let entries = self.extractor.extract_listing(&raw)?;
        if entries.is_empty() {
            return Err(CrawlError::Extract(format!(
                "listing page {page} has no entries"
            )));
        }

        let listed = entries.len();
        let entries: Vec<ListingEntry> = entries
            .into_iter()
            .unique_by(|e| e.link.clone())
            .collect();
        if entries.len() < listed {
            debug!(
                duplicates = listed - entries.len(),
                "Dropped repeated links on listing page"
            );
        }

        let records = self.dataset.discover(&entries, page).await?;
        let todo: Vec<ArticleRecord> = records
            .into_iter()
            .filter(|r| !r.details_complete)
            .collect();
        debug!(
            entries = entries.len(),
            already_complete = entries.len() - todo.len(),
            "Placeholders recorded"
        );

        let outcomes: Vec<_> = stream::iter(todo)
            .map(|record| self.complete_details(record))
            .buffer_unordered(article_limit.max(1))
            .collect()
            .await;

        let mut report = PageReport {
            articles: entries.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            report.details.record(outcome?);
        }
        Ok(report)
    }

    /// Fetch one detail page and upsert the result, success or sentinel.
    #[instrument(level = "info", skip_all, fields(url = %record.link))]
    async fn complete_details(
        &self,
        record: ArticleRecord,
    ) -> Result<DetailOutcome, PersistenceError> {
        let link = record.link.clone();
        let fetched = self.fetch(FetchTarget::Article { url: link.clone() }).await;

        // Listing fields may have been refreshed while the fetch was in flight.
        let mut current = self.dataset.get(&link).await.unwrap_or(record);
        let outcome = match fetched {
            Ok(raw) => {
                let detail = self.extractor.extract_detail(&raw);
                let outcome = if detail.abstract_text.is_text() {
                    DetailOutcome::Fetched
                } else {
                    DetailOutcome::NotFound
                };
                current.apply_detail(detail);
                outcome
            }
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "Detail fetch failed");
                current.mark_fetch_failed(!e.is_transient());
                DetailOutcome::Failed
            }
        };
        self.dataset.upsert(current).await?;
        Ok(outcome)
    }

    async fn complete_all(
        &self,
        records: Vec<ArticleRecord>,
        limit: usize,
    ) -> Result<DetailTally, CrawlError> {
        let token = self.cancel.clone();
        let mut outcomes = pin!(
            stream::iter(records)
                .take_while(move |_| ready(!token.is_cancelled()))
                .map(|record| self.complete_details(record))
                .buffer_unordered(limit.max(1))
        );
        let mut tally = DetailTally::default();
        while let Some(outcome) = outcomes.next().await {
            tally.record(outcome?);
        }
        Ok(tally)
    }

    /// Retry failed pages, then records whose details are still incomplete,
    /// both at the compensation concurrency.
    #[instrument(level = "info", skip_all)]
    async fn compensate(
        &self,
        tracker: &ProgressTracker,
        summary: &mut CrawlSummary,
    ) -> Result<(), CrawlError> {
        let limit = self.config.compensation_concurrency;
        let failed: Vec<u32> = tracker
            .snapshot()
            .await
            .failed_pages
            .into_iter()
            .filter(|p| *p <= summary.total_pages)
            .collect();
        if !failed.is_empty() {
            info!(pages = failed.len(), "Compensation: retrying failed pages");
            for &page in &failed {
                self.transition(page, UnitState::Pending);
            }
            let article_limit = limit.min(self.config.article_concurrency);
            self.sweep(&failed, limit, article_limit, tracker, summary)
                .await?;
        }
        if summary.cancelled {
            return Ok(());
        }

        let incomplete = self.dataset.incomplete().await;
        if !incomplete.is_empty() {
            info!(
                records = incomplete.len(),
                "Compensation: retrying incomplete details"
            );
            let queued = incomplete.len();
            let tally = self.complete_all(incomplete, limit).await?;
            summary.details_recovered += tally.completed();
            if tally.attempted() < queued {
                summary.cancelled = true;
                info!(
                    submitted = tally.attempted(),
                    held_back = queued - tally.attempted(),
                    "Detail compensation stopped after cancellation"
                );
            }
        }
        Ok(())
    }

    fn register(&self, pages: &[u32]) {
        if let Ok(mut book) = self.book.lock() {
            for &page in pages {
                book.units.insert(page, WorkUnit::new(page));
            }
        }
    }

    fn transition(&self, page: u32, next: UnitState) {
        let Ok(mut book) = self.book.lock() else {
            return;
        };
        if next == UnitState::InProgress {
            book.attempted.insert(page);
        }
        let unit = book
            .units
            .entry(page)
            .or_insert_with(|| WorkUnit::new(page));
        let from = unit.state;
        if !unit.transition(next) {
            warn!(page, ?from, to = ?next, "Ignored illegal work unit transition");
        }
    }

    async fn finish_summary(
        &self,
        tracker: &ProgressTracker,
        summary: &mut CrawlSummary,
        t0: Instant,
    ) {
        let progress = tracker.snapshot().await;
        if let Ok(book) = self.book.lock() {
            summary.pages_attempted = book.attempted.len();
            summary.pages_succeeded = book
                .units
                .values()
                .filter(|u| u.state == UnitState::Done)
                .count();
        }
        let total = summary.total_pages;
        summary.failed_pages = progress
            .failed_pages
            .iter()
            .copied()
            .filter(|p| *p <= total)
            .collect();
        summary.pending_pages = (1..=total)
            .filter(|p| !progress.completed_pages.contains(p) && !progress.failed_pages.contains(p))
            .collect();
        summary.dataset = self.dataset.stats().await;
        summary.incomplete_remaining = summary.dataset.incomplete;
        summary.elapsed = t0.elapsed();
    }
}
