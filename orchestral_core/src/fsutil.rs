//! Filesystem helpers shared by the stores and the MRP assembler.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use crate::errors::{OrchestralError, Result};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Builds the unique sibling temp path for an atomic write:
/// `<file>.tmp.<epochNs>-<counter>`.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!("{name}.tmp.{nanos}-{counter}"))
}

/// Writes bytes to a unique temp file, then atomically renames over the
/// target. The temp file is removed on failure, so readers only ever see
/// the old or the new full content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_sibling(path);
    if let Err(e) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Serializes a value as pretty-printed JSON and writes it atomically.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    write_atomic(path, body.as_bytes()).await
}

/// Reads and parses a JSON document. Missing files surface as `Ok(None)`.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Reads and parses a JSON document, treating a missing file as an error.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    read_json_opt(path)
        .await?
        .ok_or_else(|| OrchestralError::Validation(format!("missing artifact: {}", path.display())))
}

/// Removes a file, ignoring the case where it does not exist.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recursively copies a directory tree, creating destination directories as
/// needed. Files are overwritten.
pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let from_path = entry.path();
            let to_path = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((from_path, to_path));
            } else {
                fs::copy(&from_path, &to_path).await?;
            }
        }
    }
    Ok(())
}

/// Recursively lists all files under a directory, relative to it.
pub async fn list_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                files.push(rel.to_path_buf());
            }
        }
    }
    files.sort();
    Ok(files)
}
