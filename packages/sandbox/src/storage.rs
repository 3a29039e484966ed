// ABOUTME: Artifact storage used to seed sandbox workspaces and persist them after release
// ABOUTME: Ships a local-directory implementation; other transports plug in behind the same trait

use async_trait::async_trait;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("Storage task failed: {0}")]
    Task(String),
    #[error("Storage path escapes the storage root: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Moves workspace folders between a sandbox mount and durable storage.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Copy `remote_path` into `local_dir`. Returns false when there is nothing to copy.
    async fn download_folder(&self, remote_path: &str, local_dir: &Path) -> Result<bool>;

    /// Copy `local_dir` to `remote_path`. Returns false when `local_dir` does not exist.
    async fn upload_folder(&self, local_dir: &Path, remote_path: &str) -> Result<bool>;
}

/// Storage rooted at a directory on the local filesystem.
pub struct LocalArtifactStorage {
    root: PathBuf,
}

impl LocalArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map `remote_path` under the root. Only plain segments are accepted.
    fn resolve(&self, remote_path: &str) -> Result<PathBuf> {
        let relative = Path::new(remote_path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath(remote_path.to_string()))
                }
            }
        }
        Ok(resolved)
    }

    async fn copy(from: PathBuf, to: PathBuf) -> Result<bool> {
        tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[async_trait]
impl ArtifactStorage for LocalArtifactStorage {
    async fn download_folder(&self, remote_path: &str, local_dir: &Path) -> Result<bool> {
        Self::copy(self.resolve(remote_path)?, local_dir.to_path_buf()).await
    }

    async fn upload_folder(&self, local_dir: &Path, remote_path: &str) -> Result<bool> {
        Self::copy(local_dir.to_path_buf(), self.resolve(remote_path)?).await
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<bool> {
    if !from.is_dir() {
        return Ok(false);
    }

    let mut files = 0usize;
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| StorageError::Task(e.to_string()))?;
        let target = to.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }

    debug!(from = %from.display(), to = %to.display(), files, "Copied folder");
    Ok(true)
}
