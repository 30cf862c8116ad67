//! Storage trait definitions for layerstack
//!
//! - `LayerOutput`: the typed outputs one layer exposes to later layers
//! - `DeploymentState`: every recorded `LayerOutput`, keyed by layer name
//! - `StateStore`: backend-agnostic load/save/clear plus read-modify-write
//!
//! All backends are async. In-memory fakes are provided for testing via the
//! `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Schema version written into every persisted state document.
pub const STATE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// LayerOutput
// ---------------------------------------------------------------------------

/// Outputs exposed by a single layer.
///
/// Layers build this without a timestamp; the orchestrator stamps it when
/// the output is recorded, so two reads of unchanged external state compare
/// equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerOutput {
    /// Layer this output belongs to
    pub layer_name: String,
    /// Whether the orchestrator's deploy path produced this layer
    pub deployed: bool,
    /// Output values, opaque strings keyed by name
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// When the output was recorded into the deployment state
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LayerOutput {
    pub fn new(
        layer_name: impl Into<String>,
        deployed: bool,
        outputs: BTreeMap<String, String>,
    ) -> Self {
        Self {
            layer_name: layer_name.into(),
            deployed,
            outputs,
            timestamp: None,
        }
    }

    /// Look up a single output value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.outputs.get(key).map(String::as_str)
    }

    /// Return a copy stamped with the given record time.
    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }
}

// ---------------------------------------------------------------------------
// DeploymentState
// ---------------------------------------------------------------------------

/// Last-known outputs of every processed layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    #[serde(default)]
    pub layers: BTreeMap<String, LayerOutput>,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
}

impl Default for DeploymentState {
    fn default() -> Self {
        Self {
            layers: BTreeMap::new(),
            timestamp: Utc::now(),
            version: STATE_VERSION,
        }
    }
}

impl DeploymentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs recorded for `layer`, if any.
    pub fn layer(&self, layer: &str) -> Option<&LayerOutput> {
        self.layers.get(layer)
    }

    /// Record (or replace) a layer's outputs.
    pub fn record(&mut self, output: LayerOutput) {
        self.layers.insert(output.layer_name.clone(), output);
        self.touch();
    }

    /// Drop a layer's outputs. Returns the removed entry.
    pub fn remove(&mut self, layer: &str) -> Option<LayerOutput> {
        let removed = self.layers.remove(layer);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Refresh the document timestamp.
    pub fn touch(&mut self) {
        self.timestamp = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Persistence backend for [`DeploymentState`].
///
/// Guarantees:
/// - `load` returns `Ok(None)` when nothing has been saved (or after `clear`).
/// - `save` replaces the whole document; readers never observe a partial write.
/// - `clear` is idempotent.
///
/// Backends are single-writer: callers must not run two orchestrators
/// against the same location concurrently.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the persisted state, if any.
    async fn load(&self) -> StorageResult<Option<DeploymentState>>;

    /// Persist the full state document.
    async fn save(&self, state: &DeploymentState) -> StorageResult<()>;

    /// Delete the persisted state. No-op if absent.
    async fn clear(&self) -> StorageResult<()>;

    /// Human-readable location, used in log lines.
    fn location(&self) -> String;

    /// Read-modify-write: load (or start empty), apply `mutate`, save.
    async fn update(
        &self,
        mutate: Box<dyn for<'m> FnOnce(&'m mut DeploymentState) + Send>,
    ) -> StorageResult<DeploymentState> {
        let mut state = self.load().await?.unwrap_or_default();
        mutate(&mut state);
        state.touch();
        self.save(&state).await?;
        Ok(state)
    }
}
