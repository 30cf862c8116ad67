//! JSON file backend for [`StateStore`].
//!
//! Writes go to a sibling temp file which is then renamed over the target,
//! so a crash mid-write leaves the previous document intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{DeploymentState, StateStore, StorageResult, STATE_VERSION};

/// State persisted as a single JSON document on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_sync(path: &Path) -> StorageResult<Option<DeploymentState>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let state: DeploymentState =
            serde_json::from_str(&content).map_err(|e| StorageError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if state.version != STATE_VERSION {
            return Err(StorageError::UnsupportedVersion {
                found: state.version,
                expected: STATE_VERSION,
            });
        }
        Ok(Some(state))
    }

    fn save_sync(path: &Path, state: &DeploymentState) -> StorageResult<()> {
        let io_err = |p: &Path| {
            let p = p.to_path_buf();
            move |source: std::io::Error| StorageError::Io { path: p, source }
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }
        let content = serde_json::to_string_pretty(state)?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content).map_err(io_err(&temp_path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .map_err(io_err(&temp_path))?;
        }

        std::fs::rename(&temp_path, path).map_err(io_err(path))?;
        Ok(())
    }

    fn clear_sync(path: &Path) -> StorageResult<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

fn join_err(e: tokio::task::JoinError) -> StorageError {
    StorageError::Task(e.to_string())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> StorageResult<Option<DeploymentState>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::load_sync(&path))
            .await
            .map_err(join_err)?
    }

    async fn save(&self, state: &DeploymentState) -> StorageResult<()> {
        let path = self.path.clone();
        let layers = state.layers.len();
        let state = state.clone();
        tokio::task::spawn_blocking(move || Self::save_sync(&path, &state))
            .await
            .map_err(join_err)??;
        debug!(path = %self.path.display(), layers, "state saved");
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::clear_sync(&path))
            .await
            .map_err(join_err)?
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
