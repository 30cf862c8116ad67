//! `external` layers: pre-existing stacks the orchestrator consumes but does
//! not own.
//!
//! ```yaml
//! deployment:
//!   kind: external
//!   endpoints:
//!     - { name: registry, url: "https://registry.internal", liveness: /v2/ }
//!   outputs:
//!     registry_url: https://registry.internal
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use layerstack_state::LayerOutput;
use serde::Deserialize;
use tracing::info;

use super::registry::LayerServices;
use super::{DeployResult, DestroyResult, LayerContext, LayerController, VerifyResult};
use crate::error::{LayerError, StackError, StackResult};
use crate::graph::LayerDefinition;
use crate::health::{EndpointDescriptor, HealthOracle};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalSpec {
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

pub struct ExternalLayer {
    name: String,
    spec: ExternalSpec,
    oracle: HealthOracle,
}

impl ExternalLayer {
    pub const KIND: &'static str = "external";

    pub fn from_definition(def: &LayerDefinition, services: &LayerServices) -> StackResult<Self> {
        let spec: ExternalSpec = serde_json::from_value(def.deployment.spec.clone()).map_err(|e| {
            StackError::ConfigValidation {
                field: format!("layers.{}.deployment", def.name),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            name: def.name.clone(),
            spec,
            oracle: services.oracle.clone(),
        })
    }

    fn static_output(&self) -> LayerOutput {
        LayerOutput::new(&self.name, false, self.spec.outputs.clone())
    }

    async fn probe(&self) -> Result<(), String> {
        if self.spec.endpoints.is_empty() {
            return Ok(());
        }
        let report = self
            .oracle
            .check_multiple(&self.spec.endpoints, self.oracle.policy().timeout())
            .await;
        if report.overall {
            Ok(())
        } else {
            Err(report.failure_summary())
        }
    }
}

#[async_trait]
impl LayerController for ExternalLayer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, _ctx: &LayerContext) -> VerifyResult {
        match self.probe().await {
            Ok(()) => VerifyResult::skip(
                format!("{} external endpoint(s) healthy", self.spec.endpoints.len()),
                self.static_output(),
            ),
            Err(summary) => VerifyResult::proceed(format!("external stack unhealthy: {summary}")),
        }
    }

    async fn deploy(&self, _ctx: &LayerContext) -> DeployResult {
        let detail = match self.probe().await {
            Ok(()) => "endpoints recovered after verification".to_string(),
            Err(summary) => summary,
        };
        DeployResult::failed(
            format!(
                "external layer '{}' is not managed here and cannot be deployed: {detail}",
                self.name
            ),
            Duration::ZERO,
        )
    }

    async fn collect_outputs(&self, _ctx: &LayerContext) -> Result<LayerOutput, LayerError> {
        Ok(self.static_output())
    }

    async fn destroy(&self, _ctx: &LayerContext) -> DestroyResult {
        info!(layer = %self.name, "external layer is not owned; leaving it in place");
        DestroyResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ProcessExecutor, TokioProcessExecutor};
    use crate::health::{HealthPolicy, ProbeClient, ProbeError, ProbeResponse};
    use crate::source::CommandSourceFetcher;
    use std::sync::Arc;

    /// Healthy for URLs containing "up", unreachable otherwise.
    struct UrlProbe;

    #[async_trait]
    impl ProbeClient for UrlProbe {
        async fn get(&self, url: &str, _t: Duration) -> Result<ProbeResponse, ProbeError> {
            if url.contains("up") {
                Ok(ProbeResponse::ok("{}"))
            } else {
                Err(ProbeError::Unreachable("connection refused".into()))
            }
        }
    }

    fn external(spec: serde_json::Value) -> ExternalLayer {
        let executor: Arc<dyn ProcessExecutor> = Arc::new(TokioProcessExecutor);
        let services = LayerServices {
            executor: executor.clone(),
            oracle: HealthOracle::new(Arc::new(UrlProbe), HealthPolicy::default()),
            fetcher: Arc::new(CommandSourceFetcher::new(executor, ".", ".cache")),
        };
        let mut def = LayerDefinition::new("registry", "external", &[]);
        def.deployment.spec = spec;
        ExternalLayer::from_definition(&def, &services).unwrap()
    }

    #[tokio::test]
    async fn test_healthy_external_stack_is_skipped_with_static_outputs() {
        let layer = external(serde_json::json!({
            "kind": "external",
            "endpoints": [{"name": "reg", "url": "http://up.internal"}],
            "outputs": {"registry_url": "http://up.internal"}
        }));
        let result = layer.verify(&LayerContext::default()).await;
        assert!(result.skip);
        assert_eq!(
            result.existing_output.unwrap().get("registry_url"),
            Some("http://up.internal")
        );
    }

    #[tokio::test]
    async fn test_unhealthy_external_stack_cannot_deploy() {
        let layer = external(serde_json::json!({
            "endpoints": [
                {"name": "reg", "url": "http://up.internal"},
                {"name": "mirror", "url": "http://down.internal"}
            ]
        }));
        let verify = layer.verify(&LayerContext::default()).await;
        assert!(!verify.skip);
        assert!(verify.reason.unwrap().contains("mirror"));

        let deploy = layer.deploy(&LayerContext::default()).await;
        assert!(!deploy.success);
        assert!(deploy.error.unwrap().contains("mirror"));
    }

    #[tokio::test]
    async fn test_destroy_is_a_no_op() {
        let layer = external(serde_json::json!({}));
        assert!(layer.destroy(&LayerContext::default()).await.success);
    }
}
