//! `command` layers: effectors are configured commands run inside the
//! layer's source tree.
//!
//! ```yaml
//! deployment:
//!   kind: command
//!   source: { path: ./cluster }
//!   deploy: ["terraform apply -auto-approve"]
//!   destroy: ["terraform destroy -auto-approve"]
//!   outputs: ["terraform output -json"]
//!   verify:
//!     command: ["./check.sh", "${network.vpc_id}"]
//!     health: { name: api, url: "http://${network.lb_host}:8080" }
//!   wait_healthy: { name: api, url: "http://${network.lb_host}:8080" }
//!   env: { TF_VAR_vpc_id: "${network.vpc_id}" }
//!   timeout_secs: 900
//! ```
//!
//! String commands run through `sh -c`; list commands are executed as-is.
//! `${layer.key}` placeholders are replaced with upstream outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use layerstack_state::LayerOutput;
use regex::Regex;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::LayerServices;
use super::{DeployResult, DestroyResult, LayerContext, LayerController, VerifyResult};
use crate::error::{diagnostic_tail, LayerError, StackError, StackResult};
use crate::exec::{ExecOptions, ProcessOutput};
use crate::graph::LayerDefinition;
use crate::health::EndpointDescriptor;
use crate::source::SourceRef;

const PLACEHOLDER: &str = r"\$\{([A-Za-z0-9_-]+)\.([A-Za-z0-9_.-]+)\}";

const DIAGNOSTIC_LINES: usize = 20;
const DIAGNOSTIC_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    fn argv(&self) -> Vec<String> {
        match self {
            CommandLine::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
            CommandLine::Argv(argv) => argv.clone(),
        }
    }

    fn display(&self) -> String {
        match self {
            CommandLine::Shell(line) => line.clone(),
            CommandLine::Argv(argv) => argv.join(" "),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VerifySpec {
    pub command: Option<CommandLine>,
    pub health: Option<EndpointDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub deploy: Vec<CommandLine>,
    #[serde(default)]
    pub destroy: Vec<CommandLine>,
    #[serde(default)]
    pub outputs: Vec<CommandLine>,
    #[serde(default)]
    pub verify: Option<VerifySpec>,
    #[serde(default)]
    pub wait_healthy: Option<EndpointDescriptor>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-command limit; 0 disables it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

pub struct CommandLayer {
    name: String,
    source: SourceRef,
    spec: CommandSpec,
    services: LayerServices,
    placeholder: Regex,
}

impl CommandLayer {
    pub const KIND: &'static str = "command";

    pub fn from_definition(def: &LayerDefinition, services: &LayerServices) -> StackResult<Self> {
        let field = |suffix: &str| format!("layers.{}.deployment{suffix}", def.name);
        let source = def
            .deployment
            .source
            .clone()
            .ok_or_else(|| StackError::ConfigValidation {
                field: field(".source"),
                reason: "command layers require a source".to_string(),
            })?;
        let spec: CommandSpec = serde_json::from_value(def.deployment.spec.clone()).map_err(|e| {
            StackError::ConfigValidation {
                field: field(""),
                reason: e.to_string(),
            }
        })?;
        if spec.deploy.is_empty() {
            return Err(StackError::ConfigValidation {
                field: field(".deploy"),
                reason: "at least one deploy command is required".to_string(),
            });
        }
        let placeholder = Regex::new(PLACEHOLDER).map_err(|e| StackError::ConfigValidation {
            field: field(""),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: def.name.clone(),
            source,
            spec,
            services: services.clone(),
            placeholder,
        })
    }

    /// Replace `${layer.key}` placeholders with upstream outputs.
    fn resolve(&self, text: &str, ctx: &LayerContext) -> Result<String, LayerError> {
        let mut resolved = String::with_capacity(text.len());
        let mut last = 0;
        for caps in self.placeholder.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let value = ctx
                .value(&caps[1], &caps[2])
                .ok_or_else(|| LayerError::Unresolved(whole.as_str().to_string()))?;
            resolved.push_str(&text[last..whole.start()]);
            resolved.push_str(value);
            last = whole.end();
        }
        resolved.push_str(&text[last..]);
        Ok(resolved)
    }

    fn resolve_endpoint(
        &self,
        endpoint: &EndpointDescriptor,
        ctx: &LayerContext,
    ) -> Result<EndpointDescriptor, LayerError> {
        let mut endpoint = endpoint.clone();
        endpoint.url = self.resolve(&endpoint.url, ctx)?;
        if let Some(remote) = endpoint.remote.as_mut() {
            remote.handle = self.resolve(&remote.handle, ctx)?;
        }
        Ok(endpoint)
    }

    async fn materialize(&self) -> Result<PathBuf, LayerError> {
        self.services.fetcher.materialize(&self.source).await
    }

    async fn run_command(
        &self,
        command: &CommandLine,
        root: &Path,
        ctx: &LayerContext,
    ) -> Result<ProcessOutput, LayerError> {
        let argv = command
            .argv()
            .iter()
            .map(|arg| self.resolve(arg, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let (program, args) =
            crate::exec::split_command(&argv).map_err(|e| LayerError::Command {
                command: command.display(),
                detail: e.to_string(),
            })?;

        let mut opts = ExecOptions::in_dir(root);
        for (key, value) in &self.spec.env {
            opts.env.insert(key.clone(), self.resolve(value, ctx)?);
        }
        opts.env
            .insert("LAYERSTACK_LAYER".to_string(), self.name.clone());
        if self.spec.timeout_secs > 0 {
            opts.timeout = Some(Duration::from_secs(self.spec.timeout_secs));
        }

        debug!(layer = %self.name, command = %command.display(), "running command");
        let output = self
            .services
            .executor
            .run(program, args, &opts)
            .await
            .map_err(|e| LayerError::Command {
                command: command.display(),
                detail: e.to_string(),
            })?;
        if !output.success() {
            return Err(LayerError::Command {
                command: command.display(),
                detail: format!(
                    "exit code {}: {}",
                    output.exit_code,
                    diagnostic_tail(output.diagnostics(), DIAGNOSTIC_LINES, DIAGNOSTIC_CHARS)
                ),
            });
        }
        Ok(output)
    }

    /// Run every output command concurrently and merge their key/value
    /// pairs. Later commands win on duplicate keys.
    async fn read_outputs(&self, root: &Path, ctx: &LayerContext) -> Result<LayerOutput, LayerError> {
        let runs = self
            .spec
            .outputs
            .iter()
            .map(|command| self.run_command(command, root, ctx));
        let results = futures::future::join_all(runs).await;

        let mut outputs = BTreeMap::new();
        for result in results {
            outputs.extend(parse_outputs(&result?.stdout)?);
        }
        Ok(LayerOutput::new(&self.name, false, outputs))
    }
}

/// Parse command output into key/value pairs.
///
/// Accepts a JSON object (values of the form `{"value": ...}` are unwrapped,
/// as printed by `terraform output -json`) or `KEY=value` lines. Blank lines
/// and `#` comments are ignored.
pub fn parse_outputs(text: &str) -> Result<BTreeMap<String, String>, LayerError> {
    let trimmed = text.trim();
    let mut outputs = BTreeMap::new();
    if trimmed.is_empty() {
        return Ok(outputs);
    }

    if trimmed.starts_with('{') {
        let value: serde_json::Value =
            serde_json::from_str(trimmed).map_err(|e| LayerError::OutputParse(e.to_string()))?;
        let Some(object) = value.as_object() else {
            return Err(LayerError::OutputParse("expected a JSON object".to_string()));
        };
        for (key, value) in object {
            let value = match value {
                serde_json::Value::Object(inner) if inner.contains_key("value") => &inner["value"],
                other => other,
            };
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            outputs.insert(key.clone(), text);
        }
        return Ok(outputs);
    }

    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| LayerError::OutputParse(format!("expected KEY=value, got `{line}`")))?;
        outputs.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(outputs)
}

#[async_trait]
impl LayerController for CommandLayer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, ctx: &LayerContext) -> VerifyResult {
        let verify = match &self.spec.verify {
            Some(v) if v.command.is_some() || v.health.is_some() => v,
            _ => return VerifyResult::proceed("no verification configured"),
        };

        let root = match self.materialize().await {
            Ok(root) => root,
            Err(e) => return VerifyResult::proceed(e.to_string()),
        };

        if let Some(command) = &verify.command {
            if let Err(e) = self.run_command(command, &root, ctx).await {
                return VerifyResult::proceed(format!("verification failed: {e}"));
            }
        }

        if let Some(endpoint) = &verify.health {
            let endpoint = match self.resolve_endpoint(endpoint, ctx) {
                Ok(ep) => ep,
                Err(e) => return VerifyResult::proceed(e.to_string()),
            };
            let oracle = &self.services.oracle;
            let result = oracle
                .check_endpoint(&endpoint, oracle.policy().timeout())
                .await;
            if !result.healthy {
                return VerifyResult::proceed(format!(
                    "{} unhealthy: {}",
                    endpoint.name,
                    result.error.as_deref().unwrap_or("no detail")
                ));
            }
        }

        match self.read_outputs(&root, ctx).await {
            Ok(output) => VerifyResult::skip("existing deployment verified", output),
            Err(e) => VerifyResult::proceed(format!("existing outputs unreadable: {e}")),
        }
    }

    async fn deploy(&self, ctx: &LayerContext) -> DeployResult {
        let start = Instant::now();
        let root = match self.materialize().await {
            Ok(root) => root,
            Err(e) => return DeployResult::failed(e.to_string(), start.elapsed()),
        };

        for command in &self.spec.deploy {
            info!(layer = %self.name, command = %command.display(), "deploy step");
            if let Err(e) = self.run_command(command, &root, ctx).await {
                return DeployResult::failed(e.to_string(), start.elapsed());
            }
        }

        if let Some(endpoint) = &self.spec.wait_healthy {
            let endpoint = match self.resolve_endpoint(endpoint, ctx) {
                Ok(ep) => ep,
                Err(e) => return DeployResult::failed(e.to_string(), start.elapsed()),
            };
            let oracle = &self.services.oracle;
            let policy = oracle.policy();
            let result = oracle
                .wait_until_healthy(&endpoint, policy.max_retries, policy.interval(), policy.timeout())
                .await;
            if !result.healthy {
                return DeployResult::failed(
                    format!(
                        "deployed but never became healthy: {}",
                        result.error.as_deref().unwrap_or("no detail")
                    ),
                    start.elapsed(),
                );
            }
        }

        DeployResult::ok(start.elapsed())
    }

    async fn collect_outputs(&self, ctx: &LayerContext) -> Result<LayerOutput, LayerError> {
        let root = self.materialize().await?;
        if self.spec.timeout_secs == 0 {
            return self.read_outputs(&root, ctx).await;
        }
        tokio::time::timeout(
            Duration::from_secs(self.spec.timeout_secs),
            self.read_outputs(&root, ctx),
        )
        .await
        .map_err(|_| LayerError::Timeout(self.spec.timeout_secs))?
    }

    async fn destroy(&self, ctx: &LayerContext) -> DestroyResult {
        if self.spec.destroy.is_empty() {
            warn!(layer = %self.name, "no destroy commands configured; nothing to do");
            return DestroyResult::ok();
        }
        let root = match self.materialize().await {
            Ok(root) => root,
            Err(e) => return DestroyResult::failed(e.to_string()),
        };
        for command in &self.spec.destroy {
            info!(layer = %self.name, command = %command.display(), "destroy step");
            if let Err(e) = self.run_command(command, &root, ctx).await {
                return DestroyResult::failed(e.to_string());
            }
        }
        DestroyResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ProcessExecutor, TokioProcessExecutor};
    use crate::health::{HealthOracle, HealthPolicy, ProbeClient, ProbeError, ProbeResponse};
    use crate::source::CommandSourceFetcher;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct StaticProbe(Result<ProbeResponse, ProbeError>);

    #[async_trait]
    impl ProbeClient for StaticProbe {
        async fn get(&self, _url: &str, _t: Duration) -> Result<ProbeResponse, ProbeError> {
            self.0.clone()
        }
    }

    fn services(dir: &TempDir, probe: StaticProbe) -> LayerServices {
        let executor: Arc<dyn ProcessExecutor> = Arc::new(TokioProcessExecutor);
        LayerServices {
            executor: executor.clone(),
            oracle: HealthOracle::new(Arc::new(probe), HealthPolicy::default()),
            fetcher: Arc::new(CommandSourceFetcher::new(
                executor,
                dir.path(),
                dir.path().join("cache"),
            )),
        }
    }

    fn layer(dir: &TempDir, spec: serde_json::Value, probe: StaticProbe) -> CommandLayer {
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let mut def = LayerDefinition::new("cluster", "command", &["network"]);
        def.deployment.source = Some(SourceRef::Path { path: "src".into() });
        def.deployment.spec = spec;
        CommandLayer::from_definition(&def, &services(dir, probe)).unwrap()
    }

    fn healthy() -> StaticProbe {
        StaticProbe(Ok(ProbeResponse::ok(r#"{"ok":true}"#)))
    }

    fn ctx() -> LayerContext {
        let mut outputs = BTreeMap::new();
        outputs.insert("vpc_id".to_string(), "vpc-42".to_string());
        let mut upstream = BTreeMap::new();
        upstream.insert("network".to_string(), LayerOutput::new("network", true, outputs));
        LayerContext::new("cluster", upstream)
    }

    #[test]
    fn test_parse_key_value_lines() {
        let parsed = parse_outputs("# header\nurl = http://x\n\nport=8080\n").unwrap();
        assert_eq!(parsed["url"], "http://x");
        assert_eq!(parsed["port"], "8080");
    }

    #[test]
    fn test_parse_terraform_json() {
        let parsed = parse_outputs(
            r#"{"endpoint": {"sensitive": false, "type": "string", "value": "https://k8s"},
                "replicas": {"value": 3}, "plain": "yes"}"#,
        )
        .unwrap();
        assert_eq!(parsed["endpoint"], "https://k8s");
        assert_eq!(parsed["replicas"], "3");
        assert_eq!(parsed["plain"], "yes");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_outputs("not a pair"),
            Err(LayerError::OutputParse(_))
        ));
    }

    #[test]
    fn test_missing_deploy_commands_rejected() {
        let dir = TempDir::new().unwrap();
        let mut def = LayerDefinition::new("cluster", "command", &[]);
        def.deployment.source = Some(SourceRef::Path { path: ".".into() });
        def.deployment.spec = serde_json::json!({"kind": "command", "deploy": []});
        let err = CommandLayer::from_definition(&def, &services(&dir, healthy()))
            .err()
            .unwrap();
        assert!(
            matches!(err, StackError::ConfigValidation { field, .. } if field == "layers.cluster.deployment.deploy")
        );
    }

    #[test]
    fn test_placeholders_resolve_from_upstream() {
        let dir = TempDir::new().unwrap();
        let layer = layer(&dir, serde_json::json!({"deploy": ["true"]}), healthy());
        assert_eq!(
            layer.resolve("id=${network.vpc_id}!", &ctx()).unwrap(),
            "id=vpc-42!"
        );
        assert_eq!(
            layer.resolve("${network.subnet}", &ctx()).unwrap_err(),
            LayerError::Unresolved("${network.subnet}".to_string())
        );
    }

    #[tokio::test]
    async fn test_deploy_runs_in_source_dir_with_env() {
        let dir = TempDir::new().unwrap();
        let layer = layer(
            &dir,
            serde_json::json!({
                "deploy": ["echo \"$VPC\" > deployed.txt"],
                "env": {"VPC": "${network.vpc_id}"}
            }),
            healthy(),
        );
        let result = layer.deploy(&ctx()).await;
        assert!(result.success, "{:?}", result.error);
        let written = std::fs::read_to_string(dir.path().join("src/deployed.txt")).unwrap();
        assert_eq!(written.trim(), "vpc-42");
    }

    #[tokio::test]
    async fn test_deploy_failure_carries_diagnostics() {
        let dir = TempDir::new().unwrap();
        let layer = layer(
            &dir,
            serde_json::json!({"deploy": ["echo quota exceeded >&2; exit 4"]}),
            healthy(),
        );
        let result = layer.deploy(&ctx()).await;
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("exit code 4"));
        assert!(error.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_collect_outputs_merges_commands() {
        let dir = TempDir::new().unwrap();
        let layer = layer(
            &dir,
            serde_json::json!({
                "deploy": ["true"],
                "outputs": ["echo a=1; echo b=2", ["sh", "-c", "echo '{\"b\": {\"value\": \"3\"}}'"]]
            }),
            healthy(),
        );
        let output = layer.collect_outputs(&ctx()).await.unwrap();
        assert_eq!(output.layer_name, "cluster");
        assert_eq!(output.get("a"), Some("1"));
        assert_eq!(output.get("b"), Some("3"));
        assert!(output.timestamp.is_none());
    }

    #[tokio::test]
    async fn test_verify_without_checks_proceeds() {
        let dir = TempDir::new().unwrap();
        let layer = layer(&dir, serde_json::json!({"deploy": ["true"]}), healthy());
        let result = layer.verify(&ctx()).await;
        assert!(!result.skip);
    }

    #[tokio::test]
    async fn test_verify_skips_when_checks_pass_and_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let layer = layer(
            &dir,
            serde_json::json!({
                "deploy": ["false"],
                "outputs": ["echo endpoint=https://k8s"],
                "verify": {"command": "test ${network.vpc_id} = vpc-42", "health": {"name": "api", "url": "http://api"}}
            }),
            healthy(),
        );
        let first = layer.verify(&ctx()).await;
        assert!(first.skip, "{:?}", first.reason);
        assert_eq!(
            first.existing_output.as_ref().unwrap().get("endpoint"),
            Some("https://k8s")
        );
        assert_eq!(layer.verify(&ctx()).await, first);
    }

    #[tokio::test]
    async fn test_verify_unhealthy_endpoint_proceeds() {
        let dir = TempDir::new().unwrap();
        let layer = layer(
            &dir,
            serde_json::json!({
                "deploy": ["true"],
                "verify": {"health": {"name": "api", "url": "http://api"}}
            }),
            StaticProbe(Err(ProbeError::Request("bad gateway".into()))),
        );
        let result = layer.verify(&ctx()).await;
        assert!(!result.skip);
        assert!(result.reason.unwrap().contains("bad gateway"));
    }

    #[tokio::test]
    async fn test_destroy_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let layer = layer(
            &dir,
            serde_json::json!({"deploy": ["true"], "destroy": ["exit 1"]}),
            healthy(),
        );
        let result = layer.destroy(&ctx()).await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
