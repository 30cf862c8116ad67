//! Layer source trees.
//!
//! A layer's `deployment.source` names where its effector files live: a
//! local directory, or a git repository checked out into the source cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{diagnostic_tail, LayerError};
use crate::exec::{ExecOptions, ProcessExecutor};

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Where a layer's source tree comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceRef {
    Git {
        git: String,
        #[serde(default)]
        rev: Option<String>,
        /// Sub-directory inside the checkout to use as the layer root.
        #[serde(default)]
        subdir: Option<PathBuf>,
    },
    Path {
        path: PathBuf,
    },
}

impl SourceRef {
    /// Stable cache directory name for a git source.
    pub fn cache_key(url: &str, rev: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update(b"@");
        hasher.update(rev.unwrap_or("HEAD").as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Make the source available locally and return its root directory.
    async fn materialize(&self, source: &SourceRef) -> Result<PathBuf, LayerError>;
}

/// Resolves path sources against the config directory and clones git
/// sources with the `git` binary.
pub struct CommandSourceFetcher {
    executor: Arc<dyn ProcessExecutor>,
    base_dir: PathBuf,
    cache_dir: PathBuf,
}

impl CommandSourceFetcher {
    pub fn new(
        executor: Arc<dyn ProcessExecutor>,
        base_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            base_dir: base_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    async fn git(&self, args: &[&str], cwd: &Path) -> Result<(), LayerError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let opts = ExecOptions::in_dir(cwd).with_timeout(GIT_TIMEOUT);
        let out = self
            .executor
            .run("git", &args, &opts)
            .await
            .map_err(|e| LayerError::Source(e.to_string()))?;
        if !out.success() {
            return Err(LayerError::Source(format!(
                "git {} failed: {}",
                args.join(" "),
                diagnostic_tail(out.diagnostics(), 5, 400)
            )));
        }
        Ok(())
    }

    /// Clone and check out into a staging directory, then move it to
    /// `checkout`. Only a checkout at the requested revision ever lands in
    /// the cache.
    async fn fetch_git(
        &self,
        url: &str,
        rev: Option<&str>,
        key: &str,
        checkout: &Path,
    ) -> Result<(), LayerError> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| LayerError::Source(e.to_string()))?;
        let staging = self.cache_dir.join(format!("{key}.partial"));
        remove_if_present(&staging).await?;

        info!(url, rev = ?rev, "cloning layer source");
        let target = staging.to_string_lossy().to_string();
        let fetched = async {
            self.git(&["clone", "--quiet", url, target.as_str()], &self.cache_dir)
                .await?;
            if let Some(rev) = rev {
                self.git(&["checkout", "--quiet", rev], &staging).await?;
            }
            Ok::<(), LayerError>(())
        }
        .await;
        if let Err(e) = fetched {
            if let Err(cleanup) = remove_if_present(&staging).await {
                warn!(staging = %staging.display(), error = %cleanup, "failed to remove partial checkout");
            }
            return Err(e);
        }

        remove_if_present(checkout).await?;
        tokio::fs::rename(&staging, checkout)
            .await
            .map_err(|e| LayerError::Source(format!("{}: {e}", checkout.display())))
    }
}

async fn remove_if_present(dir: &Path) -> Result<(), LayerError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LayerError::Source(format!("{}: {e}", dir.display()))),
    }
}

#[async_trait]
impl SourceFetcher for CommandSourceFetcher {
    async fn materialize(&self, source: &SourceRef) -> Result<PathBuf, LayerError> {
        match source {
            SourceRef::Path { path } => {
                let root = if path.is_absolute() {
                    path.clone()
                } else {
                    self.base_dir.join(path)
                };
                if !root.is_dir() {
                    return Err(LayerError::Source(format!(
                        "{} is not a directory",
                        root.display()
                    )));
                }
                Ok(root)
            }
            SourceRef::Git { git, rev, subdir } => {
                let key = SourceRef::cache_key(git, rev.as_deref());
                let checkout = self.cache_dir.join(&key);

                if checkout.join(".git").is_dir() {
                    debug!(url = %git, checkout = %checkout.display(), "reusing cached checkout");
                } else {
                    self.fetch_git(git, rev.as_deref(), &key, &checkout).await?;
                }

                Ok(match subdir {
                    Some(sub) => checkout.join(sub),
                    None => checkout,
                })
            }
        }
    }
}
