//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and the
//! "file disappeared mid-operation is benign" semantics that the output tree
//! needs: the pipeline writes it, the publisher reads it and the retention
//! loop prunes it concurrently.

use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all(parent).await
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_quiet(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("removing file", path, e)),
    }
}

/// Remove an empty directory, treating "already gone" as success.
pub async fn remove_dir_quiet(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("removing directory", path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_file_quiet_missing() {
        let dir = tempfile::tempdir().unwrap();
        remove_file_quiet(&dir.path().join("nope")).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_dir_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_dir_all(&nested).await.unwrap();
        ensure_dir_all(&nested).await.unwrap();
        assert!(nested.is_dir());
    }
}
