//! Utility functions for logging, path derivation and durable file writes.
//!
//! - String truncation for log fields
//! - Deterministic sibling paths for the progress file and JSON snapshot
//! - Atomic write (temp file + rename) used by both stores
//! - Output directory validation before a run starts

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument};

/// Truncate a string for logging purposes.
///
/// Long strings are cut to at most `max` bytes (on a character boundary)
/// with an ellipsis and a count of the dropped bytes appended.
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Progress file path for a dataset table: `{stem}_progress.json` next to it.
pub fn progress_path_for(dataset: &Path) -> PathBuf {
    let stem = dataset
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "publications".to_string());
    dataset.with_file_name(format!("{stem}_progress.json"))
}

/// JSON snapshot path for a dataset table: same name, `.json` extension.
pub fn json_path_for(dataset: &Path) -> PathBuf {
    dataset.with_extension("json")
}

/// Replace `path` with `bytes` so that readers observe either the old or
/// the new content, never a partial write.
///
/// The bytes go to a temporary sibling which is flushed and then renamed
/// over the target.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), bytes = bytes.len()))]
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&tmp).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    debug!("Atomically replaced file");
    Ok(())
}

/// Ensure the directory that will hold `file` exists and is writable.
///
/// Creates the directory if needed, then writes and removes a probe file.
#[instrument(level = "info", skip_all, fields(file = %file.display()))]
pub async fn ensure_writable_parent(file: &Path) -> io::Result<()> {
    let dir = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).await?;
    let probe_path = dir.join("..__probe_write__");
    fs::write(&probe_path, b"").await?;
    let _ = fs::remove_file(&probe_path).await;
    info!(dir = %dir.display(), "Output directory is writable");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_log_short_string() {
        assert_eq!(truncate_for_log("Hello, world!", 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundaries() {
        let s = "心脏研究".repeat(10);
        let result = truncate_for_log(&s, 5);
        assert!(result.starts_with("心"));
        assert!(result.contains("(+117 bytes)"));
    }

    #[test]
    fn test_progress_path_is_derived_from_dataset_name() {
        assert_eq!(
            progress_path_for(Path::new("/data/heart.csv")),
            PathBuf::from("/data/heart_progress.json")
        );
        assert_eq!(
            progress_path_for(Path::new("out.csv")),
            PathBuf::from("out_progress.json")
        );
    }

    #[test]
    fn test_json_path_swaps_extension() {
        assert_eq!(
            json_path_for(Path::new("/data/heart.csv")),
            PathBuf::from("/data/heart.json")
        );
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_content_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_writable_parent_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("nested").join("out.csv");
        ensure_writable_parent(&file).await.unwrap();
        assert!(dir.path().join("nested").is_dir());
    }
}
