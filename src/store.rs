//! Dataset store: the keyed collection of [`ArticleRecord`]s.
//!
//! Records live in an in-memory table that keeps first-seen order and an
//! index from link to row. Every mutation rewrites the whole table file
//! atomically while holding the store lock, so the file on disk is always a
//! complete, duplicate-free snapshot and row order is stable across runs.
//!
//! # Table format
//!
//! ```text
//! page,title,link,disease_areas,last_updated,authors,publish_date,journal,pubmed_id,doi,abstract,details_saved
//! 1,Study of ...,https://...,Cardiovascular; Metabolic,1 May 2024,...,Yes
//! ```
//!
//! `disease_areas` is joined with `"; "`; `details_saved` is `Yes`/`No`.

use crate::config::DatasetEncoding;
use crate::error::PersistenceError;
use crate::models::{Abstract, ArticleRecord, DatasetStats, ListingEntry};
use crate::utils::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const COLUMNS: [&str; 12] = [
    "page",
    "title",
    "link",
    "disease_areas",
    "last_updated",
    "authors",
    "publish_date",
    "journal",
    "pubmed_id",
    "doi",
    "abstract",
    "details_saved",
];
const AREA_DELIMITER: &str = "; ";
const BOM: &str = "\u{feff}";

/// External snapshot formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Table,
    Json,
}

/// What an [`DatasetStore::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

/// One row of the table file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct TableRow {
    /// Empty or garbled cells in older tables load as page 0.
    #[serde(deserialize_with = "csv::invalid_option")]
    page: Option<u32>,
    title: String,
    link: String,
    disease_areas: String,
    last_updated: String,
    authors: String,
    publish_date: String,
    journal: String,
    pubmed_id: String,
    doi: String,
    #[serde(rename = "abstract")]
    abstract_text: String,
    details_saved: String,
}

impl From<&ArticleRecord> for TableRow {
    fn from(r: &ArticleRecord) -> Self {
        TableRow {
            page: Some(r.page),
            title: r.title.clone(),
            link: r.link.clone(),
            disease_areas: r.disease_areas.join(AREA_DELIMITER),
            last_updated: r.last_updated.clone(),
            authors: r.authors.clone(),
            publish_date: r.publish_date.clone(),
            journal: r.journal.clone(),
            pubmed_id: r.pubmed_id.clone(),
            doi: r.doi.clone(),
            abstract_text: r.abstract_text.as_str().to_string(),
            details_saved: if r.details_complete { "Yes" } else { "No" }.to_string(),
        }
    }
}

impl From<TableRow> for ArticleRecord {
    fn from(row: TableRow) -> Self {
        ArticleRecord {
            page: row.page.unwrap_or_default(),
            title: row.title,
            link: row.link.trim().to_string(),
            disease_areas: row
                .disease_areas
                .split(';')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            last_updated: row.last_updated,
            authors: row.authors,
            publish_date: row.publish_date,
            journal: row.journal,
            pubmed_id: row.pubmed_id,
            doi: row.doi,
            abstract_text: Abstract::from(row.abstract_text),
            details_complete: parse_marker(&row.details_saved),
        }
    }
}

fn parse_marker(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "yes" | "y" | "true" | "1" | "是"
    )
}

/// Ordered rows plus a link → position index.
#[derive(Debug, Default, Clone)]
struct Table {
    rows: Vec<ArticleRecord>,
    index: HashMap<String, usize>,
}

impl Table {
    fn upsert(&mut self, record: ArticleRecord) -> UpsertOutcome {
        match self.index.get(&record.link) {
            Some(&pos) if self.rows[pos] == record => UpsertOutcome::Unchanged,
            Some(&pos) => {
                self.rows[pos] = record;
                UpsertOutcome::Replaced
            }
            None => {
                self.index.insert(record.link.clone(), self.rows.len());
                self.rows.push(record);
                UpsertOutcome::Inserted
            }
        }
    }
}

/// Durable, single-writer collection of article records keyed by link.
#[derive(Debug)]
pub struct DatasetStore {
    path: PathBuf,
    encoding: DatasetEncoding,
    table: Mutex<Table>,
}

impl DatasetStore {
    /// Open the table at `path`, loading existing rows if the file exists.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(
        path: impl AsRef<Path>,
        encoding: DatasetEncoding,
    ) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => parse_table(&path, bytes, encoding)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Table::default(),
            Err(e) => return Err(PersistenceError::io(&path, e)),
        };
        info!(rows = table.rows.len(), "Opened dataset");
        Ok(DatasetStore {
            path,
            encoding,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert `record`, or replace the row with the same link in place.
    ///
    /// The whole table is rewritten atomically after every change. Memory is
    /// only updated once that write succeeds, so a failed write leaves both
    /// the file and this store as they were.
    ///
    /// # Arguments
    ///
    /// * `record` - The record to store, keyed by its canonical `link`
    ///
    /// # Returns
    ///
    /// `Inserted` for a new link, `Replaced` when an existing row changed,
    /// `Unchanged` when the stored row was already identical (no write).
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let outcome = store.upsert(record.clone()).await?;
    /// assert_eq!(store.upsert(record).await?, UpsertOutcome::Unchanged);
    /// ```
    pub async fn upsert(&self, record: ArticleRecord) -> Result<UpsertOutcome, PersistenceError> {
        let mut table = self.table.lock().await;
        let link = record.link.clone();
        let mut next = table.clone();
        let outcome = next.upsert(record);
        if outcome != UpsertOutcome::Unchanged {
            self.write_table(&next).await?;
            *table = next;
        }
        debug!(%link, ?outcome, "Upserted record");
        Ok(outcome)
    }

    /// Record listing sightings as placeholders.
    ///
    /// New links get an incomplete placeholder; known links only have their
    /// listing fields refreshed. Returns the current record for every entry,
    /// in input order, after a single table write.
    pub async fn discover(
        &self,
        entries: &[ListingEntry],
        page: u32,
    ) -> Result<Vec<ArticleRecord>, PersistenceError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let mut changed = false;
        let mut current = Vec::with_capacity(entries.len());

        for entry in entries {
            let record = match next.index.get(&entry.link) {
                Some(&pos) => {
                    let mut merged = next.rows[pos].clone();
                    merged.merge_listing(entry, page);
                    merged
                }
                None => ArticleRecord::placeholder(entry, page),
            };
            changed |= next.upsert(record.clone()) != UpsertOutcome::Unchanged;
            current.push(record);
        }

        if changed {
            self.write_table(&next).await?;
            *table = next;
        }
        Ok(current)
    }

    pub async fn get(&self, link: &str) -> Option<ArticleRecord> {
        let table = self.table.lock().await;
        table.index.get(link).map(|&pos| table.rows[pos].clone())
    }

    pub async fn records(&self) -> Vec<ArticleRecord> {
        self.table.lock().await.rows.clone()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    /// Records whose detail fetch has not completed.
    pub async fn incomplete(&self) -> Vec<ArticleRecord> {
        self.filtered(|r| !r.details_complete).await
    }

    /// Records whose abstract is empty or a sentinel.
    pub async fn with_missing_abstract(&self) -> Vec<ArticleRecord> {
        self.filtered(ArticleRecord::missing_abstract).await
    }

    async fn filtered(&self, keep: impl Fn(&ArticleRecord) -> bool) -> Vec<ArticleRecord> {
        let table = self.table.lock().await;
        table.rows.iter().filter(|r| keep(*r)).cloned().collect()
    }

    pub async fn stats(&self) -> DatasetStats {
        let table = self.table.lock().await;
        let rows = &table.rows;
        DatasetStats {
            rows: rows.len(),
            with_abstract: rows.iter().filter(|r| r.abstract_text.is_text()).count(),
            with_doi: rows.iter().filter(|r| !r.doi.is_empty()).count(),
            with_pubmed_id: rows.iter().filter(|r| !r.pubmed_id.is_empty()).count(),
            incomplete: rows.iter().filter(|r| !r.details_complete).count(),
        }
    }

    /// Write a snapshot of the current contents to `path`.
    #[instrument(level = "info", skip_all, fields(?format, path = %path.display()))]
    pub async fn export(&self, format: ExportFormat, path: &Path) -> Result<usize, PersistenceError> {
        let table = self.table.lock().await;
        let bytes = match format {
            ExportFormat::Table => encode_table(&table.rows, self.encoding, path)?,
            ExportFormat::Json => serde_json::to_vec_pretty(&table.rows).map_err(|source| {
                PersistenceError::Json {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
        };
        write_atomic(path, &bytes)
            .await
            .map_err(|e| PersistenceError::io(path, e))?;
        info!(rows = table.rows.len(), "Exported dataset");
        Ok(table.rows.len())
    }

    /// Drop every record and truncate the table file.
    pub async fn reset(&self) -> Result<(), PersistenceError> {
        let mut table = self.table.lock().await;
        let dropped = table.rows.len();
        let empty = Table::default();
        self.write_table(&empty).await?;
        *table = empty;
        warn!(dropped, "Dataset reset");
        Ok(())
    }

    async fn write_table(&self, table: &Table) -> Result<(), PersistenceError> {
        let bytes = encode_table(&table.rows, self.encoding, &self.path)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))
    }
}

fn encode_table(
    rows: &[ArticleRecord],
    encoding: DatasetEncoding,
    path: &Path,
) -> Result<Vec<u8>, PersistenceError> {
    let table_err = |source: csv::Error| PersistenceError::Table {
        path: path.to_path_buf(),
        source,
    };

    let mut buf = Vec::new();
    if encoding == DatasetEncoding::Utf8Bom {
        buf.extend_from_slice(BOM.as_bytes());
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(buf);
    writer.write_record(COLUMNS).map_err(table_err)?;
    for record in rows {
        writer.serialize(TableRow::from(record)).map_err(table_err)?;
    }
    writer
        .into_inner()
        .map_err(|e| PersistenceError::io(path, e.into_error()))
}

fn parse_table(
    path: &Path,
    bytes: Vec<u8>,
    encoding: DatasetEncoding,
) -> Result<Table, PersistenceError> {
    let text = String::from_utf8(bytes).map_err(|_| PersistenceError::Encoding {
        path: path.to_path_buf(),
        encoding: encoding.label().to_string(),
    })?;
    let text = text.strip_prefix(BOM).unwrap_or(&text);

    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let mut table = Table::default();
    let mut duplicates = 0usize;
    for row in reader.deserialize::<TableRow>() {
        let row = row.map_err(|source| PersistenceError::Table {
            path: path.to_path_buf(),
            source,
        })?;
        let record = ArticleRecord::from(row);
        if record.link.is_empty() {
            continue;
        }
        if table.upsert(record) != UpsertOutcome::Inserted {
            duplicates += 1;
        }
    }
    if duplicates > 0 {
        warn!(duplicates, "Collapsed duplicate links while loading dataset");
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(link: &str) -> ArticleRecord {
        ArticleRecord {
            page: 2,
            title: "Genetics of atrial fibrillation, revisited".to_string(),
            link: link.to_string(),
            disease_areas: vec!["Cardiovascular".to_string(), "Genetics".to_string()],
            last_updated: "3 June 2024".to_string(),
            authors: "Doe A, \"Roe\" B".to_string(),
            publish_date: "2024-06-01".to_string(),
            journal: "Nature Genetics".to_string(),
            pubmed_id: "38111111".to_string(),
            doi: "10.1038/ng.1".to_string(),
            abstract_text: Abstract::Text("Line one.\nLine two, with comma.".to_string()),
            details_complete: true,
        }
    }

    async fn open(dir: &tempfile::TempDir) -> DatasetStore {
        DatasetStore::open(dir.path().join("pubs.csv"), DatasetEncoding::Utf8Bom)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_same_record_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        assert_eq!(store.upsert(record("https://e.org/a")).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(record("https://e.org/a")).await.unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("https://e.org/a").await, Some(record("https://e.org/a")));
    }

    #[tokio::test]
    async fn test_replace_keeps_row_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        for link in ["https://e.org/a", "https://e.org/b", "https://e.org/c"] {
            store.upsert(record(link)).await.unwrap();
        }
        let mut changed = record("https://e.org/a");
        changed.title = "Updated".to_string();
        assert_eq!(store.upsert(changed).await.unwrap(), UpsertOutcome::Replaced);

        let links: Vec<String> = store.records().await.into_iter().map(|r| r.link).collect();
        assert_eq!(links, ["https://e.org/a", "https://e.org/b", "https://e.org/c"]);
        assert_eq!(store.records().await[0].title, "Updated");
    }

    #[tokio::test]
    async fn test_concurrent_upserts_never_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir).await);
        let n = 12;
        let m = 9;

        let mut handles = Vec::new();
        for i in 0..n {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.upsert(record(&format!("https://e.org/distinct/{i}"))).await
            }));
        }
        for j in 0..m {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut shared = record("https://e.org/shared");
                shared.title = format!("version {j}");
                store.upsert(shared).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.len().await, n + 1);
        let reopened = open(&dir).await;
        assert_eq!(reopened.len().await, n + 1);
    }

    #[tokio::test]
    async fn test_table_round_trips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let mut not_found = record("https://e.org/nf");
        not_found.abstract_text = Abstract::NotFound;
        let mut placeholder = record("https://e.org/ph");
        placeholder.abstract_text = Abstract::Missing;
        placeholder.details_complete = false;
        for r in [record("https://e.org/a"), not_found.clone(), placeholder.clone()] {
            store.upsert(r).await.unwrap();
        }

        let reopened = open(&dir).await;
        assert_eq!(reopened.get("https://e.org/a").await, Some(record("https://e.org/a")));
        assert_eq!(reopened.get("https://e.org/nf").await, Some(not_found));
        assert_eq!(reopened.get("https://e.org/ph").await, Some(placeholder));
    }

    #[tokio::test]
    async fn test_table_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        store.upsert(record("https://e.org/a")).await.unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.starts_with(BOM));
        let header = raw.trim_start_matches(BOM).lines().next().unwrap();
        assert_eq!(header, COLUMNS.join(","));
        assert!(raw.contains("Cardiovascular; Genetics"));
        assert!(raw.trim_end().ends_with(",Yes"));
    }

    #[tokio::test]
    async fn test_empty_store_still_writes_header_on_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        store.upsert(record("https://e.org/a")).await.unwrap();
        store.reset().await.unwrap();
        assert_eq!(store.len().await, 0);
        let reopened = open(&dir).await;
        assert_eq!(reopened.len().await, 0);
    }

    #[tokio::test]
    async fn test_discover_creates_placeholders_without_downgrading() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        store.upsert(record("https://e.org/done")).await.unwrap();

        let entries = vec![
            ListingEntry {
                title: "Fresh".into(),
                link: "https://e.org/new".into(),
                ..Default::default()
            },
            ListingEntry {
                title: "Genetics of atrial fibrillation, revisited".into(),
                link: "https://e.org/done".into(),
                ..Default::default()
            },
        ];
        let current = store.discover(&entries, 5).await.unwrap();
        assert!(!current[0].details_complete);
        assert_eq!(current[0].page, 5);
        assert!(current[1].details_complete);
        assert_eq!(current[1].doi, "10.1038/ng.1");
        assert_eq!(store.incomplete().await.len(), 1);
    }

    #[tokio::test]
    async fn test_json_export_keeps_disease_area_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        store.upsert(record("https://e.org/a")).await.unwrap();
        let out = dir.path().join("pubs.json");
        assert_eq!(store.export(ExportFormat::Json, &out).await.unwrap(), 1);

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(value[0]["disease_areas"], serde_json::json!(["Cardiovascular", "Genetics"]));
        assert_eq!(value[0]["details_saved"], true);
        let back: Vec<ArticleRecord> = serde_json::from_value(value).unwrap();
        assert_eq!(back[0], record("https://e.org/a"));
    }

    #[tokio::test]
    async fn test_legacy_markers_are_understood() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubs.csv");
        let legacy = format!(
            "{BOM}page,title,link,disease_areas,last_updated,authors,publish_date,journal,pubmed_id,doi,abstract,details_saved\n\
             1,T,https://e.org/x,Heart,,,,,,,未找到摘要,是\n\
             1,T2,https://e.org/y,,,,,,,,,否\n"
        );
        std::fs::write(&path, legacy).unwrap();
        let store = DatasetStore::open(&path, DatasetEncoding::Utf8Bom).await.unwrap();
        let x = store.get("https://e.org/x").await.unwrap();
        assert_eq!(x.abstract_text, Abstract::NotFound);
        assert!(x.details_complete);
        let y = store.get("https://e.org/y").await.unwrap();
        assert!(!y.details_complete);
        assert_eq!(store.with_missing_abstract().await.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_page_cell_loads_as_page_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubs.csv");
        let legacy = "page,title,link,abstract,details_saved\n\
                      ,Untracked,https://e.org/u,Some text.,Yes\n\
                      4,Tracked,https://e.org/t,,No\n";
        std::fs::write(&path, legacy).unwrap();

        let store = DatasetStore::open(&path, DatasetEncoding::Utf8).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("https://e.org/u").await.unwrap().page, 0);
        assert_eq!(store.get("https://e.org/t").await.unwrap().page, 4);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone").join("pubs.csv");
        let store = DatasetStore::open(&path, DatasetEncoding::Utf8Bom).await.unwrap();

        let err = store.upsert(record("https://e.org/a")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }), "{err}");
        assert_eq!(store.len().await, 0);
        assert_eq!(store.get("https://e.org/a").await, None);

        let entries = vec![ListingEntry {
            title: "Fresh".into(),
            link: "https://e.org/new".into(),
            ..Default::default()
        }];
        assert!(store.discover(&entries, 1).await.is_err());
        assert!(store.incomplete().await.is_empty());

        std::fs::create_dir(dir.path().join("gone")).unwrap();
        assert_eq!(
            store.upsert(record("https://e.org/a")).await.unwrap(),
            UpsertOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn test_non_utf8_table_is_an_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubs.csv");
        std::fs::write(&path, [0x70, 0x61, 0x67, 0x65, 0x0a, 0xc4, 0xe3, 0xba, 0xc3]).unwrap();
        let err = DatasetStore::open(&path, DatasetEncoding::Utf8).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Encoding { .. }));
    }

    #[tokio::test]
    async fn test_stats_count_sentinels_separately() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        store.upsert(record("https://e.org/a")).await.unwrap();
        let mut failed = record("https://e.org/b");
        failed.abstract_text = Abstract::FetchFailed;
        failed.doi.clear();
        failed.details_complete = false;
        store.upsert(failed).await.unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.rows, 2);
        assert_eq!(stats.with_abstract, 1);
        assert_eq!(stats.with_doi, 1);
        assert_eq!(stats.with_pubmed_id, 2);
        assert_eq!(stats.incomplete, 1);
    }
}
