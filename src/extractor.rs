//! Extraction capability: raw page content in, structured fields out.
//!
//! The orchestrator only sees the [`Extractor`] trait. [`PublicationsExtractor`]
//! implements it for the publication listing markup:
//!
//! | Field | Source |
//! |-------|--------|
//! | result count | text like `1 to 10 of 23 results found` |
//! | listing entries | `ul.post-listing__list > li` |
//! | title / link | `a.link--stretched-before` |
//! | last updated | `time.card__date` |
//! | metadata | `div.meta__item` `dt`/`dd` pairs |
//! | abstract | `<p>` siblings following an `<h2>` mentioning "Abstract" |

use crate::error::CrawlError;
use crate::models::{Abstract, ArticleDetail, ListingEntry};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use url::Url;

/// Turns fetched content into records. Implementations are synchronous and
/// never block; all waiting happens in the fetcher.
pub trait Extractor: Send + Sync {
    /// Total number of results reported by a listing page, if stated.
    fn extract_total_results(&self, raw: &str) -> Option<u64>;

    /// Candidate articles on a listing page.
    ///
    /// An `Extract` error means the page is not a listing at all; a listing
    /// with no entries is returned as an empty vector.
    fn extract_listing(&self, raw: &str) -> Result<Vec<ListingEntry>, CrawlError>;

    /// Fields of a detail page. A missing abstract section yields
    /// [`Abstract::NotFound`].
    fn extract_detail(&self, raw: &str) -> ArticleDetail;
}

static RANGE_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[\d,]+\s+(?:to|-|–)\s+[\d,]+\s+of\s+([\d,]+)\s+results?\b")
        .expect("static regex")
});
static BARE_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b([\d,]+)\s+results?\s+found\b").expect("static regex"));

static LIST: Lazy<Selector> = Lazy::new(|| sel("ul.post-listing__list"));
static LIST_ITEM: Lazy<Selector> = Lazy::new(|| sel("ul.post-listing__list > li"));
static TITLE_LINK: Lazy<Selector> = Lazy::new(|| sel("a.link--stretched-before"));
static CARD_DATE: Lazy<Selector> = Lazy::new(|| sel("time.card__date"));
static META_ITEM: Lazy<Selector> = Lazy::new(|| sel("div.meta__item"));
static DT: Lazy<Selector> = Lazy::new(|| sel("dt"));
static DD: Lazy<Selector> = Lazy::new(|| sel("dd"));
static ANCHOR: Lazy<Selector> = Lazy::new(|| sel("a"));
static LIST_ENTRY: Lazy<Selector> = Lazy::new(|| sel("li"));
static H2: Lazy<Selector> = Lazy::new(|| sel("h2"));

fn sel(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

/// Collapse an element's text into single-spaced, trimmed form.
fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `(label, dd)` pairs from every `div.meta__item` under `scope`.
fn meta_pairs<'a>(scope: ElementRef<'a>) -> Vec<(String, ElementRef<'a>)> {
    scope
        .select(&META_ITEM)
        .filter_map(|item| {
            let dt = item.select(&DT).next()?;
            let dd = item.select(&DD).next()?;
            Some((text_of(dt).to_lowercase(), dd))
        })
        .collect()
}

/// Disease areas come either as a nested list or as a delimited string.
fn split_areas(dd: ElementRef<'_>) -> Vec<String> {
    let items: Vec<String> = dd
        .select(&LIST_ENTRY)
        .map(text_of)
        .filter(|s| !s.is_empty())
        .collect();
    if !items.is_empty() {
        return items;
    }
    text_of(dd)
        .split([',', ';'])
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_count(raw: &str) -> Option<u64> {
    raw.replace(',', "").parse().ok()
}

/// Extractor for the publication listing site.
#[derive(Debug, Clone)]
pub struct PublicationsExtractor {
    base: Url,
}

impl PublicationsExtractor {
    /// `base_url` resolves relative article links.
    pub fn new(base_url: &str) -> Result<Self, CrawlError> {
        let base = Url::parse(base_url)
            .map_err(|e| CrawlError::Config(format!("invalid base_url {base_url}: {e}")))?;
        Ok(PublicationsExtractor { base })
    }

    /// Absolute link without fragment: the natural key of a record.
    fn canonical_link(&self, href: &str) -> Option<String> {
        let mut url = self.base.join(href.trim()).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        url.set_fragment(None);
        Some(url.to_string())
    }

    fn listing_entry(&self, li: ElementRef<'_>) -> Option<ListingEntry> {
        let anchor = li.select(&TITLE_LINK).next()?;
        let title = text_of(anchor);
        let link = self.canonical_link(anchor.value().attr("href")?)?;
        if title.is_empty() {
            return None;
        }

        let mut entry = ListingEntry {
            title,
            link,
            last_updated: li.select(&CARD_DATE).next().map(text_of).unwrap_or_default(),
            ..Default::default()
        };
        for (label, dd) in meta_pairs(li) {
            if label.contains("author") {
                entry.authors = text_of(dd);
            } else if label.contains("journal") {
                entry.journal = text_of(dd);
            } else if label.contains("disease") {
                entry.disease_areas = split_areas(dd);
            }
        }
        Some(entry)
    }
}

impl Extractor for PublicationsExtractor {
    fn extract_total_results(&self, raw: &str) -> Option<u64> {
        let document = Html::parse_document(raw);
        let text = text_of(document.root_element());
        RANGE_COUNT
            .captures(&text)
            .or_else(|| BARE_COUNT.captures(&text))
            .and_then(|caps| parse_count(&caps[1]))
    }

    fn extract_listing(&self, raw: &str) -> Result<Vec<ListingEntry>, CrawlError> {
        let document = Html::parse_document(raw);
        if document.select(&LIST).next().is_none() {
            return Err(CrawlError::Extract("listing container not found".into()));
        }

        let mut skipped = 0usize;
        let entries: Vec<ListingEntry> = document
            .select(&LIST_ITEM)
            .filter_map(|li| {
                let entry = self.listing_entry(li);
                if entry.is_none() {
                    skipped += 1;
                }
                entry
            })
            .collect();

        if skipped > 0 {
            warn!(skipped, kept = entries.len(), "Listing items without title or link");
        }
        debug!(count = entries.len(), "Extracted listing entries");
        Ok(entries)
    }

    fn extract_detail(&self, raw: &str) -> ArticleDetail {
        let document = Html::parse_document(raw);
        let mut detail = ArticleDetail::default();

        for (label, dd) in meta_pairs(document.root_element()) {
            if label.contains("publish date") {
                detail.publish_date = text_of(dd);
            } else if label.contains("pubmed") {
                detail.pubmed_id = text_of(dd);
            } else if label.contains("doi") {
                detail.doi = dd.select(&ANCHOR).next().map(text_of).unwrap_or_else(|| text_of(dd));
            } else if label.contains("author") {
                detail.authors = text_of(dd);
            } else if label.contains("journal") {
                detail.journal = text_of(dd);
            } else if label.contains("disease") {
                detail.disease_areas = split_areas(dd);
            } else if label.contains("updated") {
                detail.last_updated = text_of(dd);
            }
        }

        detail.abstract_text = match extract_abstract(&document) {
            Some(text) => Abstract::Text(text),
            None => Abstract::NotFound,
        };
        detail
    }
}

/// Paragraphs after the "Abstract" heading, up to the next heading.
fn extract_abstract(document: &Html) -> Option<String> {
    let heading = document
        .select(&H2)
        .find(|h| text_of(*h).to_lowercase().contains("abstract"))?;

    let mut parts = Vec::new();
    for sibling in heading.next_siblings().filter_map(ElementRef::wrap) {
        match sibling.value().name() {
            "h2" | "h3" | "h4" => break,
            "p" => {
                let text = text_of(sibling);
                if !text.is_empty() {
                    parts.push(text);
                }
            }
            _ => {}
        }
    }
    if parts.is_empty() { None } else { Some(parts.join(" ")) }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn extractor() -> PublicationsExtractor {
        PublicationsExtractor::new(BASE).unwrap()
    }

    #[test]
    fn test_total_results_from_range_text() {
        let html = listing_html(23, 1, &[]);
        assert_eq!(extractor().extract_total_results(&html), Some(23));
    }

    #[test]
    fn test_total_results_with_thousands_separator() {
        let html = "<div>Showing 1 to 10 of 2,315 results found</div>";
        assert_eq!(extractor().extract_total_results(html), Some(2315));
    }

    #[test]
    fn test_total_results_absent() {
        let html = "<html><body><ul class='pagination'><li>1</li></ul></body></html>";
        assert_eq!(extractor().extract_total_results(html), None);
    }

    #[test]
    fn test_listing_entries_are_resolved_and_populated() {
        let links = vec![
            "/publications/relative-one/".to_string(),
            "https://example.org/publications/absolute-two/#top".to_string(),
        ];
        let entries = extractor().extract_listing(&listing_html(2, 1, &links)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].link, "https://example.org/publications/relative-one/");
        assert_eq!(entries[1].link, "https://example.org/publications/absolute-two/");
        assert_eq!(entries[0].title, "Study 1.0 of cardiac outcomes");
        assert_eq!(entries[0].authors, "Smith J, Lee K");
        assert_eq!(entries[0].journal, "European Heart Journal");
        assert_eq!(entries[0].last_updated, "1 May 2024");
        assert_eq!(entries[0].disease_areas, vec!["Cardiovascular", "Metabolic"]);
    }

    #[test]
    fn test_listing_without_container_is_an_extract_error() {
        let err = extractor()
            .extract_listing("<html><body><p>Access denied</p></body></html>")
            .unwrap_err();
        assert!(matches!(err, CrawlError::Extract(_)));
    }

    #[test]
    fn test_empty_listing_is_ok_and_empty() {
        let entries = extractor().extract_listing(&listing_html(0, 1, &[])).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_detail_fields_and_abstract() {
        let detail = extractor().extract_detail(&detail_html(Some("We examined 500,000 participants.")));
        assert_eq!(detail.publish_date, "2024-05-01");
        assert_eq!(detail.pubmed_id, "38000001");
        assert_eq!(detail.doi, "10.1000/heart.1");
        assert_eq!(
            detail.abstract_text,
            Abstract::Text("We examined 500,000 participants. Second paragraph.".to_string())
        );
    }

    #[test]
    fn test_detail_without_abstract_section_is_not_found() {
        let detail = extractor().extract_detail(&detail_html(None));
        assert_eq!(detail.abstract_text, Abstract::NotFound);
        assert_eq!(detail.pubmed_id, "38000001");
    }

    #[test]
    fn test_disease_areas_from_nested_list() {
        let html = r#"<div class="meta__item"><dt>Disease areas</dt><dd><ul><li>Cancer</li><li>Heart</li></ul></dd></div>"#;
        let detail = extractor().extract_detail(html);
        assert_eq!(detail.disease_areas, vec!["Cancer", "Heart"]);
    }
}
