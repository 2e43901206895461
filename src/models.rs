//! Data models for crawled publications and the units of crawl work.
//!
//! - [`ArticleRecord`]: one publication, keyed by its canonical link
//! - [`Abstract`]: abstract text or a sentinel recording why there is none
//! - [`ListingEntry`] / [`ArticleDetail`]: what the extractor hands back
//!   for listing pages and detail pages respectively
//! - [`WorkUnit`] / [`UnitState`]: one listing page and its lifecycle
//! - [`CrawlSummary`]: the console report printed at the end of a run

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Abstract of a publication.
///
/// The sentinels distinguish "looked and found nothing" from "could not
/// look", and both from "never looked" (`Missing`, paired with
/// `details_complete == false`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Abstract {
    #[default]
    Missing,
    Text(String),
    NotFound,
    FetchFailed,
}

impl Abstract {
    pub const NOT_FOUND: &'static str = "NotFound";
    pub const FETCH_FAILED: &'static str = "FetchFailed";

    pub fn as_str(&self) -> &str {
        match self {
            Abstract::Missing => "",
            Abstract::Text(text) => text,
            Abstract::NotFound => Self::NOT_FOUND,
            Abstract::FetchFailed => Self::FETCH_FAILED,
        }
    }

    /// `true` when there is real abstract text.
    pub fn is_text(&self) -> bool {
        matches!(self, Abstract::Text(_))
    }
}

impl From<String> for Abstract {
    fn from(value: String) -> Self {
        match value.trim() {
            "" => Abstract::Missing,
            Self::NOT_FOUND | "未找到摘要" => Abstract::NotFound,
            Self::FETCH_FAILED | "获取失败" => Abstract::FetchFailed,
            _ => Abstract::Text(value),
        }
    }
}

impl From<Abstract> for String {
    fn from(value: Abstract) -> Self {
        match value {
            Abstract::Text(text) => text,
            other => other.as_str().to_string(),
        }
    }
}

/// One publication as stored in the dataset.
///
/// `link` is the natural key: exactly one record per link exists in the
/// dataset, and later writes for the same link replace the earlier row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    /// Listing page the record was discovered on (provenance only).
    pub page: u32,
    pub title: String,
    pub link: String,
    pub disease_areas: Vec<String>,
    pub last_updated: String,
    pub authors: String,
    pub publish_date: String,
    pub journal: String,
    pub pubmed_id: String,
    pub doi: String,
    #[serde(rename = "abstract")]
    pub abstract_text: Abstract,
    #[serde(rename = "details_saved")]
    pub details_complete: bool,
}

impl ArticleRecord {
    /// Placeholder written as soon as an article shows up in a listing.
    pub fn placeholder(entry: &ListingEntry, page: u32) -> Self {
        ArticleRecord {
            page,
            title: entry.title.clone(),
            link: entry.link.clone(),
            disease_areas: entry.disease_areas.clone(),
            last_updated: entry.last_updated.clone(),
            authors: entry.authors.clone(),
            journal: entry.journal.clone(),
            ..Default::default()
        }
    }

    /// Refresh listing-level fields from a newer sighting of the same link.
    ///
    /// Detail fields and completion state are left untouched; non-empty
    /// values are never replaced with empty ones.
    pub fn merge_listing(&mut self, entry: &ListingEntry, page: u32) {
        self.page = page;
        fill(&mut self.title, &entry.title);
        fill(&mut self.last_updated, &entry.last_updated);
        fill(&mut self.authors, &entry.authors);
        fill(&mut self.journal, &entry.journal);
        if !entry.disease_areas.is_empty() {
            self.disease_areas = entry.disease_areas.clone();
        }
    }

    /// Fold a successfully fetched detail page into the record.
    pub fn apply_detail(&mut self, detail: ArticleDetail) {
        fill(&mut self.publish_date, &detail.publish_date);
        fill(&mut self.pubmed_id, &detail.pubmed_id);
        fill(&mut self.doi, &detail.doi);
        fill(&mut self.authors, &detail.authors);
        fill(&mut self.journal, &detail.journal);
        fill(&mut self.last_updated, &detail.last_updated);
        if !detail.disease_areas.is_empty() {
            self.disease_areas = detail.disease_areas;
        }
        // A NotFound result never overwrites text we already have.
        if detail.abstract_text.is_text() || !self.abstract_text.is_text() {
            self.abstract_text = detail.abstract_text;
        }
        self.details_complete = true;
    }

    /// Record a detail fetch that did not produce content.
    ///
    /// `definitive` failures (e.g. the page is gone) complete the record;
    /// transient ones leave it eligible for the compensation pass.
    pub fn mark_fetch_failed(&mut self, definitive: bool) {
        if !self.abstract_text.is_text() {
            self.abstract_text = Abstract::FetchFailed;
        }
        if definitive {
            self.details_complete = true;
        }
    }

    /// `true` when the abstract is absent or a sentinel.
    pub fn missing_abstract(&self) -> bool {
        !self.abstract_text.is_text()
    }
}

fn fill(slot: &mut String, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        *slot = value.to_string();
    }
}

/// Candidate article found on a listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingEntry {
    pub title: String,
    /// Absolute, canonical article URL.
    pub link: String,
    pub last_updated: String,
    pub authors: String,
    pub journal: String,
    pub disease_areas: Vec<String>,
}

/// Fields only available on an article's detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleDetail {
    pub publish_date: String,
    pub pubmed_id: String,
    pub doi: String,
    pub authors: String,
    pub journal: String,
    pub last_updated: String,
    pub disease_areas: Vec<String>,
    pub abstract_text: Abstract,
}

/// Lifecycle state of a [`WorkUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl UnitState {
    /// Allowed moves: Pending → InProgress → {Done, Failed}, Failed → Pending.
    pub fn can_transition_to(self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (InProgress, Done) | (InProgress, Failed) | (Failed, Pending)
        )
    }
}

/// One page of the paginated listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkUnit {
    pub page_number: u32,
    pub state: UnitState,
}

impl WorkUnit {
    pub fn new(page_number: u32) -> Self {
        WorkUnit {
            page_number,
            state: UnitState::Pending,
        }
    }

    /// Move to `next`, returning `false` (and staying put) on an illegal move.
    pub fn transition(&mut self, next: UnitState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// Row counts used in the end-of-run report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetStats {
    pub rows: usize,
    pub with_abstract: usize,
    pub with_doi: usize,
    pub with_pubmed_id: usize,
    pub incomplete: usize,
}

/// Outcome of a crawl run, printed to the console.
#[derive(Debug, Clone, Default)]
pub struct CrawlSummary {
    pub total_pages: u32,
    pub pages_attempted: usize,
    pub pages_succeeded: usize,
    /// Pages still failed after compensation, ascending.
    pub failed_pages: Vec<u32>,
    /// Pages never submitted (only non-empty after cancellation).
    pub pending_pages: Vec<u32>,
    pub articles_extracted: u64,
    pub details_recovered: usize,
    pub incomplete_remaining: usize,
    /// The cancellation token kept at least one page or record from being
    /// submitted. A token set after the last submission leaves this false.
    pub cancelled: bool,
    pub elapsed: Duration,
    pub dataset: DatasetStats,
}

impl CrawlSummary {
    /// `true` when nothing is left for a future resume: no failed or pending
    /// pages, and no work held back by cancellation.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed_pages.is_empty() && self.pending_pages.is_empty()
    }
}

impl fmt::Display for CrawlSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f64();
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "Crawl summary{}", if self.cancelled { " (cancelled)" } else { "" })?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "Total pages:          {}", self.total_pages)?;
        writeln!(f, "Pages attempted:      {}", self.pages_attempted)?;
        writeln!(f, "Pages succeeded:      {}", self.pages_succeeded)?;
        writeln!(f, "Pages failed:         {}", self.failed_pages.len())?;
        if !self.failed_pages.is_empty() {
            writeln!(f, "Failed page numbers:  {}", self.failed_pages.iter().join(", "))?;
        }
        if !self.pending_pages.is_empty() {
            writeln!(f, "Not yet attempted:    {}", self.pending_pages.len())?;
        }
        writeln!(f, "Articles extracted:   {}", self.articles_extracted)?;
        writeln!(f, "Details recovered:    {}", self.details_recovered)?;
        writeln!(f, "Incomplete records:   {}", self.incomplete_remaining)?;
        writeln!(f, "Dataset rows:         {}", self.dataset.rows)?;
        writeln!(f, "  with abstract:      {}", self.dataset.with_abstract)?;
        writeln!(f, "  with DOI:           {}", self.dataset.with_doi)?;
        writeln!(f, "  with PubMed ID:     {}", self.dataset.with_pubmed_id)?;
        write!(f, "Elapsed:              {secs:.2}s")
    }
}
