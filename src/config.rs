//! Crawl configuration.
//!
//! Values come from an optional YAML file (`--config crawl.yaml`) and are then
//! overridden by command-line flags. Every field has a default, so an empty
//! or absent file is valid.
//!
//! ```yaml
//! base_url: https://www.ukbiobank.ac.uk/discoveries-and-impact/publications/
//! keyword: heart
//! page_concurrency: 3
//! article_concurrency: 4
//! retry:
//!   max_attempts: 3
//!   base_delay_ms: 1000
//! ```

use crate::error::CrawlError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument, warn};

/// Text encoding of the dataset table file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasetEncoding {
    /// Plain UTF-8.
    Utf8,
    /// UTF-8 with a leading byte-order mark, which spreadsheet tools expect.
    #[default]
    Utf8Bom,
}

impl DatasetEncoding {
    pub fn label(self) -> &'static str {
        match self {
            DatasetEncoding::Utf8 => "UTF-8",
            DatasetEncoding::Utf8Bom => "UTF-8 (with BOM)",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Listing endpoint; pages are requested as `?_keyword=..&_paged=N`.
    pub base_url: String,
    /// Search keyword; part of the stored filter parameters.
    pub keyword: String,
    /// Results per listing page, used to derive the page count.
    pub page_size: u32,
    /// Listing pages processed in parallel.
    pub page_concurrency: usize,
    /// Detail pages fetched in parallel within one listing page.
    pub article_concurrency: usize,
    /// Parallelism of the compensation pass.
    pub compensation_concurrency: usize,
    /// Ceiling on concurrently open fetch sessions.
    pub max_sessions: usize,
    pub fetch_timeout_secs: u64,
    /// Politeness delay before every request.
    pub request_delay_ms: u64,
    pub user_agent: String,
    pub retry: RetryPolicy,
    pub encoding: DatasetEncoding,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        CrawlConfig {
            base_url: "https://www.ukbiobank.ac.uk/discoveries-and-impact/publications/".to_string(),
            keyword: "heart".to_string(),
            page_size: 10,
            page_concurrency: 3,
            article_concurrency: 4,
            compensation_concurrency: 2,
            max_sessions: 12,
            fetch_timeout_secs: 30,
            request_delay_ms: 0,
            user_agent: concat!("publication_crawler/", env!("CARGO_PKG_VERSION")).to_string(),
            retry: RetryPolicy::default(),
            encoding: DatasetEncoding::default(),
        }
    }
}

impl CrawlConfig {
    /// Load from a YAML file, or fall back to defaults when `path` is `None`.
    #[instrument(level = "info", skip_all, fields(path = ?path))]
    pub async fn load(path: Option<&Path>) -> Result<Self, CrawlError> {
        let Some(path) = path else {
            return Ok(CrawlConfig::default());
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CrawlError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_yaml(&text)?;
        info!(path = %path.display(), "Loaded crawl configuration");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, CrawlError> {
        if text.trim().is_empty() {
            return Ok(CrawlConfig::default());
        }
        serde_yaml::from_str(text).map_err(|e| CrawlError::Config(e.to_string()))
    }

    /// Reject nonsensical values and fit the two concurrency levels under
    /// the session ceiling.
    pub fn validate(mut self) -> Result<Self, CrawlError> {
        if self.page_size == 0 {
            return Err(CrawlError::Config("page_size must be at least 1".into()));
        }
        for (name, value) in [
            ("page_concurrency", self.page_concurrency),
            ("article_concurrency", self.article_concurrency),
            ("compensation_concurrency", self.compensation_concurrency),
            ("max_sessions", self.max_sessions),
        ] {
            if value == 0 {
                return Err(CrawlError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.base_url.trim().is_empty() {
            return Err(CrawlError::Config("base_url must not be empty".into()));
        }

        if self.page_concurrency.saturating_mul(self.article_concurrency) > self.max_sessions {
            let lowered = (self.max_sessions / self.page_concurrency).max(1);
            warn!(
                page_concurrency = self.page_concurrency,
                requested = self.article_concurrency,
                lowered,
                max_sessions = self.max_sessions,
                "Article concurrency exceeds the session ceiling; lowering it"
            );
            self.article_concurrency = lowered;
        }
        Ok(self)
    }

    /// Query identity recorded in the progress file.
    pub fn filters(&self) -> FilterParameters {
        FilterParameters {
            base_url: self.base_url.clone(),
            keyword: self.keyword.clone(),
            page_size: self.page_size,
        }
    }
}

/// The query that determined `total_pages`.
///
/// Stored alongside progress so a resumed run can tell when the query it is
/// resuming is not the one it started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParameters {
    pub base_url: String,
    pub keyword: String,
    pub page_size: u32,
}

impl std::fmt::Display for FilterParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "keyword={:?} page_size={} at {}",
            self.keyword, self.page_size, self.base_url
        )
    }
}
