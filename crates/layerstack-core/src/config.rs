//! Stack configuration file (YAML).
//!
//! ```yaml
//! settings:
//!   state_file: .layerstack/state.json
//!   continue_on_error: false
//!   health:
//!     max_retries: 5
//!     interval_ms: 1000
//! layers:
//!   network:
//!     deployment:
//!       kind: command
//!       source: { path: ./network }
//!       deploy: ["./apply.sh"]
//!   cluster:
//!     depends_on: [network]
//!     deployment: { ... }
//! ```
//!
//! Layers are kept in declaration order; that order is the tie-break for
//! independent branches when computing the execution order.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{StackError, StackResult};
use crate::health::HealthPolicy;

/// Default remote execution command. `{handle}` is replaced by the
/// descriptor's remote handle and the diagnostic script is piped to stdin.
pub const DEFAULT_REMOTE_EXEC: [&str; 4] = ["ssh", "{handle}", "sh", "-s"];

/// Engine-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where the deployment state is persisted.
    pub state_file: PathBuf,
    /// Where git sources are checked out.
    pub source_cache: PathBuf,
    /// Keep processing remaining layers after a failure instead of rolling back.
    pub continue_on_error: bool,
    /// Health probing policy shared by every layer.
    pub health: HealthPolicy,
    /// Command template for tier-2 remote execution probes.
    pub remote_exec: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(".layerstack/state.json"),
            source_cache: PathBuf::from(".layerstack/sources"),
            continue_on_error: false,
            health: HealthPolicy::default(),
            remote_exec: DEFAULT_REMOTE_EXEC.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// One layer exactly as written in the file, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLayer {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub deployment: Option<serde_yaml::Value>,
    #[serde(default)]
    pub config: serde_yaml::Mapping,
}

fn default_enabled() -> bool {
    true
}

/// The whole file, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawStackConfig {
    pub settings: Settings,
    /// `(name, layer)` pairs in declaration order.
    pub layers: Vec<(String, RawLayer)>,
}

#[derive(Deserialize)]
struct RawFile {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    layers: serde_yaml::Mapping,
}

impl RawStackConfig {
    /// Parse YAML text. Structural problems in a single layer are reported
    /// with that layer's field path.
    pub fn from_yaml_str(text: &str) -> StackResult<Self> {
        let file: RawFile =
            serde_yaml::from_str(text).map_err(|e| StackError::ConfigValidation {
                field: "<root>".to_string(),
                reason: e.to_string(),
            })?;

        let mut layers = Vec::with_capacity(file.layers.len());
        for (key, value) in file.layers {
            let name = key
                .as_str()
                .ok_or_else(|| StackError::ConfigValidation {
                    field: "layers".to_string(),
                    reason: format!("layer names must be strings, got {key:?}"),
                })?
                .to_string();
            let layer: RawLayer =
                serde_yaml::from_value(value).map_err(|e| StackError::ConfigValidation {
                    field: format!("layers.{name}"),
                    reason: e.to_string(),
                })?;
            layers.push((name, layer));
        }

        Ok(Self {
            settings: file.settings,
            layers,
        })
    }
}

/// A loaded configuration file plus the directory it was read from.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub raw: RawStackConfig,
    /// Relative paths in the file are resolved against this directory.
    pub base_dir: PathBuf,
}

impl StackConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> StackResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StackError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml_str(&text, base_dir).map_err(|e| match e {
            StackError::ConfigValidation { field, reason } if field == "<root>" => {
                StackError::ConfigLoad {
                    path: path.to_path_buf(),
                    reason,
                }
            }
            other => other,
        })
    }

    pub fn from_yaml_str(text: &str, base_dir: impl Into<PathBuf>) -> StackResult<Self> {
        Ok(Self {
            raw: RawStackConfig::from_yaml_str(text)?,
            base_dir: base_dir.into(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.raw.settings
    }

    /// Resolve a possibly-relative path from the file against `base_dir`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.raw.settings.state_file)
    }

    pub fn source_cache(&self) -> PathBuf {
        self.resolve(&self.raw.settings.source_cache)
    }
}
