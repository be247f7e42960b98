//! Per-session staging directories.
//!
//! Each workspace is a fresh UUID-named directory below the staging root, so
//! no two sessions can ever resolve to the same path. Removal is best effort:
//! failures are logged and never reach the caller.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::Result;
use crate::utils::fs;

/// A staging directory owned by exactly one session.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Create `<root>/<session_id>`.
    pub async fn create(root: &Path, session_id: Uuid) -> Result<Self> {
        let path = root.join(session_id.to_string());
        fs::ensure_dir_all_with_op("creating staging workspace", &path).await?;
        debug!(session_id = %session_id, path = %path.display(), "Workspace created");
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Output template handed to the retriever.
    pub fn output_template(&self) -> PathBuf {
        self.path.join("media.%(ext)s")
    }

    /// Remove the directory and everything below it.
    pub async fn remove(mut self) {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove workspace")
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        // Reached when a session is abandoned before its supervisor took over.
        let path = std::mem::take(&mut self.path);
        let remove = move || {
            if let Err(e) = std::fs::remove_dir_all(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %e, "Failed to remove abandoned workspace");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn workspaces_are_unique_per_session() {
        let root = TempDir::new().unwrap();
        let a = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();
        let b = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(root.path()));
        assert!(a.output_template().to_string_lossy().ends_with("media.%(ext)s"));
    }

    #[tokio::test]
    async fn remove_deletes_only_own_directory() {
        let root = TempDir::new().unwrap();
        let a = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();
        let b = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();
        tokio::fs::write(a.path().join("media.webm"), b"data").await.unwrap();

        let a_path = a.path().to_path_buf();
        let b_path = b.path().to_path_buf();
        a.remove().await;

        assert!(!a_path.exists());
        assert!(b_path.exists());
        b.remove().await;
    }

    #[tokio::test]
    async fn remove_tolerates_missing_directory() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::create(root.path(), Uuid::new_v4()).await.unwrap();
        std::fs::remove_dir_all(ws.path()).unwrap();
        ws.remove().await;
    }

    #[test]
    fn drop_removes_abandoned_workspace() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("abandoned");
        std::fs::create_dir_all(&path).unwrap();
        drop(Workspace {
            path: path.clone(),
            removed: false,
        });
        assert!(!path.exists());
    }
}
