//! Fetch capability consumed by the orchestrator.
//!
//! # Architecture
//!
//! - [`Fetcher`]: factory for sessions (an HTTP client, a browser process,
//!   a fixture map in tests)
//! - [`FetchSession`]: one exclusive fetch resource, owned by one task
//! - [`SessionRegistry`]: hands sessions to tasks, closes them on every exit
//!   path and force-closes stragglers during shutdown
//! - [`HttpFetcher`]: the reqwest-backed implementation used by the CLI

use crate::config::CrawlConfig;
use crate::error::FetchError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchTarget {
    /// One page of the paginated listing (1-based).
    ListingPage { page: u32 },
    /// An article detail page by absolute URL.
    Article { url: String },
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchTarget::ListingPage { page } => write!(f, "listing page {page}"),
            FetchTarget::Article { url } => write!(f, "{url}"),
        }
    }
}

/// A fetch resource owned by exactly one task at a time.
#[async_trait]
pub trait FetchSession: Send + Sync {
    /// Fetch the raw content of `target`.
    async fn fetch(&self, target: &FetchTarget) -> Result<String, FetchError>;

    /// Release the underlying resource. Must be safe to call more than once.
    async fn close(&self);
}

/// Source of [`FetchSession`]s.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn open_session(&self) -> Result<Arc<dyn FetchSession>, FetchError>;
}

/// Tracks every open session so none outlives the run.
///
/// One mutex guards the live set; it is never held across an `.await`.
pub struct SessionRegistry {
    fetcher: Arc<dyn Fetcher>,
    live: Mutex<HashMap<u64, Arc<dyn FetchSession>>>,
    next_id: AtomicU64,
    opened: AtomicU64,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live", &self.live_count())
            .field("opened", &self.opened.load(Ordering::Relaxed))
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        SessionRegistry {
            fetcher,
            live: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            opened: AtomicU64::new(0),
        }
    }

    /// Number of sessions currently open.
    pub fn live_count(&self) -> usize {
        self.live.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Total sessions opened over the registry's lifetime.
    pub fn opened_count(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// Run `work` with an exclusive session that is closed afterwards,
    /// whether `work` succeeds or fails.
    pub async fn with_session<T, E, F, Fut>(&self, work: F) -> Result<T, E>
    where
        E: From<FetchError>,
        F: FnOnce(Arc<dyn FetchSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let session = self.fetcher.open_session().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.opened.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut live) = self.live.lock() {
            live.insert(id, Arc::clone(&session));
        }

        let result = work(Arc::clone(&session)).await;

        let tracked = self.live.lock().ok().and_then(|mut live| live.remove(&id));
        if tracked.is_some() {
            session.close().await;
        }
        result
    }

    /// Close every session still registered. Returns how many were closed.
    #[instrument(level = "info", skip_all)]
    pub async fn release_all(&self) -> usize {
        let leftovers: Vec<Arc<dyn FetchSession>> = match self.live.lock() {
            Ok(mut live) => live.drain().map(|(_, s)| s).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, s)| s).collect(),
        };
        let count = leftovers.len();
        for session in leftovers {
            session.close().await;
        }
        if count > 0 {
            warn!(count, "Force-released sessions left open at shutdown");
        } else {
            debug!("No sessions left open at shutdown");
        }
        count
    }
}

/// reqwest-backed fetcher.
///
/// Sessions share one connection pool; each still goes through the registry
/// so the ownership rules hold for heavier backends too.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    keyword: String,
    request_delay: Duration,
}

impl HttpFetcher {
    pub fn new(config: &CrawlConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::permanent("http client", e.to_string()))?;
        Ok(HttpFetcher {
            client,
            base_url: config.base_url.clone(),
            keyword: config.keyword.clone(),
            request_delay: Duration::from_millis(config.request_delay_ms),
        })
    }

    /// URL for `target`.
    pub fn url_for(&self, target: &FetchTarget) -> String {
        match target {
            FetchTarget::ListingPage { page } => listing_url(&self.base_url, &self.keyword, *page),
            FetchTarget::Article { url } => url.clone(),
        }
    }
}

/// `{base}?_keyword={keyword}&_paged={page}`, keyword URL-encoded.
pub fn listing_url(base_url: &str, keyword: &str, page: u32) -> String {
    let sep = if base_url.contains('?') { '&' } else { '?' };
    format!(
        "{base_url}{sep}_keyword={}&_paged={page}",
        urlencoding::encode(keyword)
    )
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn open_session(&self) -> Result<Arc<dyn FetchSession>, FetchError> {
        Ok(Arc::new(HttpSession {
            inner: self.clone(),
        }))
    }
}

struct HttpSession {
    inner: HttpFetcher,
}

#[async_trait]
impl FetchSession for HttpSession {
    #[instrument(level = "info", skip_all, fields(target = %target))]
    async fn fetch(&self, target: &FetchTarget) -> Result<String, FetchError> {
        if !self.inner.request_delay.is_zero() {
            sleep(self.inner.request_delay).await;
        }
        let url = self.inner.url_for(target);
        let t0 = Instant::now();

        let response = self
            .inner
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_transport_error(&url, &e))?;

        let status = response.status();
        if !status.is_success() {
            let reason = format!("HTTP {status}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                FetchError::transient(url, reason)
            } else {
                FetchError::permanent(url, reason)
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::transient(&url, e.to_string()))?;
        info!(
            bytes = body.len(),
            elapsed_ms = t0.elapsed().as_millis(),
            "Fetched"
        );
        Ok(body)
    }

    async fn close(&self) {}
}

fn classify_transport_error(url: &str, e: &reqwest::Error) -> FetchError {
    if e.is_builder() {
        FetchError::permanent(url, e.to_string())
    } else {
        // Timeouts, refused or reset connections and body errors.
        FetchError::transient(url, e.to_string())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! In-memory fetcher for tests.

    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Responses = Mutex<HashMap<FetchTarget, Vec<Result<String, FetchError>>>>;

    /// Serves canned responses. A target with several queued responses
    /// yields them in order and then repeats the last one.
    #[derive(Default)]
    pub struct FixtureFetcher {
        responses: Responses,
        /// Every target fetched, in order.
        pub log: Mutex<Vec<FetchTarget>>,
        /// Cancel the token once the target has been fetched this many times.
        pub cancel_on: Mutex<Option<(FetchTarget, usize, tokio_util::sync::CancellationToken)>>,
        pub fetches: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
        pub concurrent: Arc<AtomicUsize>,
        pub peak_concurrent: Arc<AtomicUsize>,
    }

    impl FixtureFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, target: FetchTarget, responses: Vec<Result<String, FetchError>>) {
            self.responses.lock().unwrap().insert(target, responses);
        }

        pub fn listing(&self, page: u32, html: String) {
            self.respond(FetchTarget::ListingPage { page }, vec![Ok(html)]);
        }

        pub fn article(&self, url: &str, html: String) {
            self.respond(FetchTarget::Article { url: url.to_string() }, vec![Ok(html)]);
        }

        pub fn fetch_count(&self, target: &FetchTarget) -> usize {
            self.log.lock().unwrap().iter().filter(|t| *t == target).count()
        }

        fn next(&self, target: &FetchTarget) -> Result<String, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let seen = {
                let mut log = self.log.lock().unwrap();
                log.push(target.clone());
                log.iter().filter(|t| *t == target).count()
            };
            if let Some((trigger, nth, token)) = self.cancel_on.lock().unwrap().as_ref() {
                if trigger == target && seen >= *nth {
                    token.cancel();
                }
            }
            let mut map = self.responses.lock().unwrap();
            match map.get_mut(target) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) if queue.len() == 1 => queue[0].clone(),
                _ => Err(FetchError::permanent(target.to_string(), "no fixture")),
            }
        }
    }

    struct FixtureSession {
        fetcher: Arc<FixtureFetcher>,
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl FetchSession for FixtureSession {
        async fn fetch(&self, target: &FetchTarget) -> Result<String, FetchError> {
            tokio::task::yield_now().await;
            self.fetcher.next(target)
        }

        async fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.fetcher.closes.fetch_add(1, Ordering::SeqCst);
                self.fetcher.concurrent.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Wrapper so tests keep a handle on the fixture while the registry owns it.
    pub struct SharedFixture(pub Arc<FixtureFetcher>);

    #[async_trait]
    impl Fetcher for SharedFixture {
        async fn open_session(&self) -> Result<Arc<dyn FetchSession>, FetchError> {
            let now = self.0.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak_concurrent.fetch_max(now, Ordering::SeqCst);
            Ok(Arc::new(FixtureSession {
                fetcher: Arc::clone(&self.0),
                closed: std::sync::atomic::AtomicBool::new(false),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_listing_url_encodes_keyword() {
        assert_eq!(
            listing_url("https://example.org/publications/", "heart failure", 3),
            "https://example.org/publications/?_keyword=heart%20failure&_paged=3"
        );
        assert_eq!(
            listing_url("https://example.org/p?lang=en", "heart", 1),
            "https://example.org/p?lang=en&_keyword=heart&_paged=1"
        );
    }

    #[test]
    fn test_http_fetcher_passes_article_urls_through() {
        let fetcher = HttpFetcher::new(&CrawlConfig::default()).unwrap();
        let url = "https://example.org/publications/abc/";
        assert_eq!(fetcher.url_for(&FetchTarget::Article { url: url.into() }), url);
        assert!(
            fetcher
                .url_for(&FetchTarget::ListingPage { page: 2 })
                .ends_with("_keyword=heart&_paged=2")
        );
    }

    #[tokio::test]
    async fn test_with_session_closes_on_success_and_failure() {
        let fixture = Arc::new(FixtureFetcher::new());
        fixture.listing(1, "<html></html>".into());
        let registry = SessionRegistry::new(Arc::new(SharedFixture(Arc::clone(&fixture))));

        let ok: Result<String, FetchError> = registry
            .with_session(|s| async move { s.fetch(&FetchTarget::ListingPage { page: 1 }).await })
            .await;
        assert!(ok.is_ok());

        let err: Result<String, FetchError> = registry
            .with_session(|s| async move { s.fetch(&FetchTarget::ListingPage { page: 2 }).await })
            .await;
        assert!(err.is_err());

        assert_eq!(registry.live_count(), 0);
        assert_eq!(fixture.closes.load(Ordering::SeqCst), 2);
        assert_eq!(registry.release_all().await, 0);
    }

    #[tokio::test]
    async fn test_release_all_closes_sessions_left_behind() {
        let fixture = Arc::new(FixtureFetcher::new());
        let registry = Arc::new(SessionRegistry::new(Arc::new(SharedFixture(Arc::clone(
            &fixture,
        )))));

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let worker = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let _: Result<(), FetchError> = registry
                    .with_session(|_s| async move {
                        let _ = started_tx.send(());
                        std::future::pending::<()>().await;
                        Ok(())
                    })
                    .await;
            })
        };
        started_rx.await.unwrap();
        worker.abort();
        let _ = worker.await;

        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.release_all().await, 1);
        assert_eq!(registry.live_count(), 0);
        assert_eq!(fixture.closes.load(Ordering::SeqCst), 1);
    }
}
