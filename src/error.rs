//! Error taxonomy for the crawl engine.
//!
//! Errors are split by how the orchestrator reacts to them:
//!
//! | Error | Reaction |
//! |-------|----------|
//! | [`CrawlError::Discovery`] | Fatal for a fresh run; a resumed run may fall back to its stored page count |
//! | [`FetchError::Transient`] | Retried by the [`RetryPolicy`](crate::retry::RetryPolicy), then the unit is marked failed |
//! | [`FetchError::Permanent`] | Not retried; the unit is marked failed |
//! | [`CrawlError::Extract`] | Listing pages are marked failed; single articles get a sentinel abstract |
//! | [`PersistenceError`] | Propagated and aborts the run |

use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a [`FetchSession`](crate::fetcher::FetchSession).
///
/// The distinction between the two variants drives retry decisions: only
/// transient failures are worth another attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Network error, timeout, throttling or resource exhaustion.
    #[error("transient fetch failure for {target}: {reason}")]
    Transient { target: String, reason: String },

    /// The target does not exist or refuses us outright.
    #[error("permanent fetch failure for {target}: {reason}")]
    Permanent { target: String, reason: String },
}

impl FetchError {
    pub fn transient(target: impl Into<String>, reason: impl Into<String>) -> Self {
        FetchError::Transient {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn permanent(target: impl Into<String>, reason: impl Into<String>) -> Self {
        FetchError::Permanent {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// A progress or dataset file could not be read or written.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed table {path}: {source}")]
    Table {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("malformed JSON {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} is not valid {encoding}; convert it to UTF-8 before using it as a dataset")]
    Encoding { path: PathBuf, encoding: String },
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Umbrella error for every crawl operation.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("could not determine the total result count: {0}")]
    Discovery(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("content did not match the expected structure: {0}")]
    Extract(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("stored progress was recorded for {stored}, current query is {current}; rerun without --resume")]
    FilterMismatch { stored: String, current: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}
