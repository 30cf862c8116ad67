//! The per-layer lifecycle contract.
//!
//! Every layer kind implements [`LayerController`]. Expected failures are
//! returned as values (`DeployResult`, `DestroyResult`, [`LayerError`]); a
//! controller never aborts the run.

pub mod command;
pub mod external;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use layerstack_state::LayerOutput;
use serde::Serialize;

use crate::error::LayerError;

pub use command::CommandLayer;
pub use external::ExternalLayer;
pub use registry::{LayerFactory, LayerRegistry, LayerServices};

/// Read-only view of the outputs recorded so far for upstream layers.
#[derive(Debug, Clone, Default)]
pub struct LayerContext {
    layer: String,
    upstream: BTreeMap<String, LayerOutput>,
}

impl LayerContext {
    pub fn new(layer: impl Into<String>, upstream: BTreeMap<String, LayerOutput>) -> Self {
        Self {
            layer: layer.into(),
            upstream,
        }
    }

    /// Name of the layer this context was built for.
    pub fn layer_name(&self) -> &str {
        &self.layer
    }

    pub fn output(&self, layer: &str) -> Option<&LayerOutput> {
        self.upstream.get(layer)
    }

    pub fn value(&self, layer: &str, key: &str) -> Option<&str> {
        self.upstream.get(layer).and_then(|o| o.get(key))
    }

    pub fn upstream(&self) -> &BTreeMap<String, LayerOutput> {
        &self.upstream
    }
}

/// Verdict of a read-only verification pass.
///
/// Contains nothing time-dependent, so two verifications of an unchanged
/// layer compare equal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyResult {
    pub skip: bool,
    pub reason: Option<String>,
    /// Outputs of the already-present layer. Present when `skip` is true.
    pub existing_output: Option<LayerOutput>,
}

impl VerifyResult {
    /// The layer already exists and is healthy.
    pub fn skip(reason: impl Into<String>, existing_output: LayerOutput) -> Self {
        Self {
            skip: true,
            reason: Some(reason.into()),
            existing_output: Some(existing_output),
        }
    }

    /// The layer must be deployed.
    pub fn proceed(reason: impl Into<String>) -> Self {
        Self {
            skip: false,
            reason: Some(reason.into()),
            existing_output: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployResult {
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

impl DeployResult {
    pub fn ok(duration: Duration) -> Self {
        Self {
            success: true,
            error: None,
            duration,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyResult {
    pub success: bool,
    pub error: Option<String>,
}

impl DestroyResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Lifecycle operations of one layer.
#[async_trait]
pub trait LayerController: Send + Sync {
    fn name(&self) -> &str;

    /// Read-only check of whether the layer already exists and is healthy.
    async fn verify(&self, ctx: &LayerContext) -> VerifyResult;

    async fn deploy(&self, ctx: &LayerContext) -> DeployResult;

    /// Read the layer's outputs. Idempotent.
    async fn collect_outputs(&self, ctx: &LayerContext) -> Result<LayerOutput, LayerError>;

    /// Best-effort teardown.
    async fn destroy(&self, ctx: &LayerContext) -> DestroyResult;
}

/// Per-run lifecycle state of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerPhase {
    Unprocessed,
    Verifying,
    Skipped,
    Deploying,
    Deployed,
    OutputsCollected,
    Failed,
    RolledBack,
}

impl LayerPhase {
    pub fn can_transition_to(self, next: LayerPhase) -> bool {
        use LayerPhase::*;
        matches!(
            (self, next),
            (Unprocessed, Verifying)
                | (Unprocessed, Deploying)
                | (Verifying, Skipped)
                | (Verifying, Deploying)
                | (Verifying, Failed)
                | (Deploying, Deployed)
                | (Deploying, Failed)
                | (Deployed, OutputsCollected)
                | (Deployed, Failed)
                | (OutputsCollected, RolledBack)
                | (Failed, RolledBack)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayerPhase::Unprocessed => "unprocessed",
            LayerPhase::Verifying => "verifying",
            LayerPhase::Skipped => "skipped",
            LayerPhase::Deploying => "deploying",
            LayerPhase::Deployed => "deployed",
            LayerPhase::OutputsCollected => "outputs_collected",
            LayerPhase::Failed => "failed",
            LayerPhase::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for LayerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use LayerPhase::*;
        for (from, to) in [
            (Unprocessed, Verifying),
            (Verifying, Deploying),
            (Deploying, Deployed),
            (Deployed, OutputsCollected),
            (OutputsCollected, RolledBack),
        ] {
            assert!(from.can_transition_to(to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_skipped_layer_cannot_be_rolled_back() {
        assert!(!LayerPhase::Skipped.can_transition_to(LayerPhase::RolledBack));
        assert!(!LayerPhase::Skipped.can_transition_to(LayerPhase::Deploying));
    }

    #[test]
    fn test_collect_failure_edge() {
        assert!(LayerPhase::Deployed.can_transition_to(LayerPhase::Failed));
        assert!(LayerPhase::Failed.can_transition_to(LayerPhase::RolledBack));
        assert!(!LayerPhase::RolledBack.can_transition_to(LayerPhase::Deploying));
    }

    #[test]
    fn test_context_lookups() {
        let mut outputs = BTreeMap::new();
        outputs.insert("vpc_id".to_string(), "vpc-9".to_string());
        let mut upstream = BTreeMap::new();
        upstream.insert(
            "network".to_string(),
            LayerOutput::new("network", true, outputs),
        );
        let ctx = LayerContext::new("cluster", upstream);
        assert_eq!(ctx.layer_name(), "cluster");
        assert_eq!(ctx.value("network", "vpc_id"), Some("vpc-9"));
        assert_eq!(ctx.value("network", "missing"), None);
        assert!(ctx.output("dns").is_none());
    }

    #[test]
    fn test_verify_constructors() {
        let out = LayerOutput::new("a", false, BTreeMap::new());
        let skip = VerifyResult::skip("present", out.clone());
        assert!(skip.skip);
        assert_eq!(skip.existing_output, Some(out));
        let go = VerifyResult::proceed("absent");
        assert!(!go.skip);
        assert!(go.existing_output.is_none());
    }
}
