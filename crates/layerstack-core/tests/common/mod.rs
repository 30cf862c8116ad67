//! Shared fakes for the integration suites.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use layerstack_core::exec::{ProcessExecutor, TokioProcessExecutor};
use layerstack_core::health::{ProbeClient, ProbeError, ProbeResponse};
use layerstack_core::{
    CommandSourceFetcher, ConfigGraph, DeployResult, DestroyResult, HealthOracle, HealthPolicy,
    LayerContext, LayerController, LayerDefinition, LayerError, LayerOutput, LayerRegistry,
    LayerServices, VerifyResult,
};

pub const SCRIPTED: &str = "scripted";

/// How a scripted layer behaves.
#[derive(Debug, Clone)]
pub struct Script {
    pub skip: bool,
    pub existing: BTreeMap<String, String>,
    pub deploy_ok: bool,
    pub outputs: Result<BTreeMap<String, String>, LayerError>,
    pub destroy_ok: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            skip: false,
            existing: BTreeMap::new(),
            deploy_ok: true,
            outputs: Ok(BTreeMap::new()),
            destroy_ok: true,
        }
    }
}

impl Script {
    pub fn skipping() -> Self {
        Self {
            skip: true,
            ..Self::default()
        }
    }

    pub fn failing_deploy() -> Self {
        Self {
            deploy_ok: false,
            ..Self::default()
        }
    }

    pub fn with_output(mut self, key: &str, value: &str) -> Self {
        if let Ok(outputs) = self.outputs.as_mut() {
            outputs.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn failing_collect(mut self) -> Self {
        self.outputs = Err(LayerError::OutputParse("garbled".to_string()));
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.destroy_ok = false;
        self
    }
}

/// Ordered record of every controller call, e.g. `deploy:B`.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Layers passed to `op`, in call order.
    pub fn layers_for(&self, op: &str) -> Vec<String> {
        let prefix = format!("{op}:");
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

pub struct ScriptedLayer {
    name: String,
    script: Script,
    log: CallLog,
}

#[async_trait]
impl LayerController for ScriptedLayer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, _ctx: &LayerContext) -> VerifyResult {
        self.log.push(format!("verify:{}", self.name));
        if self.script.skip {
            VerifyResult::skip(
                "already present",
                LayerOutput::new(&self.name, false, self.script.existing.clone()),
            )
        } else {
            VerifyResult::proceed("absent")
        }
    }

    async fn deploy(&self, ctx: &LayerContext) -> DeployResult {
        self.log.push(format!("deploy:{}", self.name));
        for (layer, output) in ctx.upstream() {
            for (key, value) in &output.outputs {
                self.log
                    .push(format!("sees:{}:{layer}.{key}={value}", self.name));
            }
        }
        if self.script.deploy_ok {
            DeployResult::ok(Duration::from_millis(5))
        } else {
            DeployResult::failed(
                format!("effector for {} exited with code 1\nquota exceeded", self.name),
                Duration::from_millis(5),
            )
        }
    }

    async fn collect_outputs(&self, _ctx: &LayerContext) -> Result<LayerOutput, LayerError> {
        self.log.push(format!("collect:{}", self.name));
        self.script
            .outputs
            .clone()
            .map(|outputs| LayerOutput::new(&self.name, false, outputs))
    }

    async fn destroy(&self, _ctx: &LayerContext) -> DestroyResult {
        self.log.push(format!("destroy:{}", self.name));
        if self.script.destroy_ok {
            DestroyResult::ok()
        } else {
            DestroyResult::failed(format!("{} is still in use", self.name))
        }
    }
}

/// A registry whose only kind builds scripted layers from `scripts`
/// (layers without a script use the default).
pub fn scripted_registry(scripts: HashMap<String, Script>, log: CallLog) -> LayerRegistry {
    let scripts = Arc::new(scripts);
    let mut registry = LayerRegistry::new();
    registry.register(
        SCRIPTED,
        false,
        Arc::new(move |def: &LayerDefinition, _services: &LayerServices| {
            Ok(Box::new(ScriptedLayer {
                name: def.name.clone(),
                script: scripts.get(&def.name).cloned().unwrap_or_default(),
                log: log.clone(),
            }) as Box<dyn LayerController>)
        }),
    );
    registry
}

/// Every URL answers with the same response.
pub struct StaticProbe(pub Result<ProbeResponse, ProbeError>);

#[async_trait]
impl ProbeClient for StaticProbe {
    async fn get(&self, _url: &str, _timeout: Duration) -> Result<ProbeResponse, ProbeError> {
        self.0.clone()
    }
}

pub fn services() -> LayerServices {
    let executor: Arc<dyn ProcessExecutor> = Arc::new(TokioProcessExecutor);
    LayerServices {
        executor: executor.clone(),
        oracle: HealthOracle::new(
            Arc::new(StaticProbe(Ok(ProbeResponse::ok("{}")))),
            HealthPolicy::default(),
        ),
        fetcher: Arc::new(CommandSourceFetcher::new(executor, ".", ".layerstack/sources")),
    }
}

pub fn scripted(name: &str, deps: &[&str]) -> LayerDefinition {
    LayerDefinition::new(name, SCRIPTED, deps)
}

pub fn graph(layers: Vec<LayerDefinition>) -> ConfigGraph {
    ConfigGraph::new(layers).expect("acyclic test graph")
}

pub fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

pub fn scripts(entries: Vec<(&str, Script)>) -> HashMap<String, Script> {
    entries
        .into_iter()
        .map(|(name, script)| (name.to_string(), script))
        .collect()
}
