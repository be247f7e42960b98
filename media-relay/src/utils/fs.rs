//! Filesystem helpers shared across modules.
//!
//! These helpers attach operation + path context to IO errors.

use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Find the first finished regular file in a directory.
///
/// Partial downloads (`.part`, `.ytdl`) are skipped. Returns `None` when the
/// directory holds no candidate.
pub async fn find_first_file(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| io_error("reading directory", dir, e))?;

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        let path = entry.path();
        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        let partial = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("part" | "ytdl")
        );
        if is_file && !partial {
            found.push(path);
        }
    }

    found.sort();
    Ok(found.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn ensure_dir_creates_nested() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        ensure_dir_all_with_op("creating test dir", &nested)
            .await
            .unwrap();
        assert!(nested.is_dir());
    }

    #[tokio::test]
    async fn find_first_file_skips_partials() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join("media.webm.part"), b"x")
            .await
            .unwrap();
        assert!(find_first_file(temp.path()).await.unwrap().is_none());

        tokio::fs::write(temp.path().join("media.webm"), b"x")
            .await
            .unwrap();
        let found = find_first_file(temp.path()).await.unwrap().unwrap();
        assert_eq!(found.file_name().unwrap(), "media.webm");
    }

    #[tokio::test]
    async fn find_first_file_missing_dir_is_error() {
        let temp = TempDir::new().unwrap();
        let err = find_first_file(&temp.path().join("nope")).await.unwrap_err();
        assert!(matches!(err, Error::IoPath { .. }));
    }
}
