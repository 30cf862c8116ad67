//! Sequential layer execution with rollback.
//!
//! Layers are processed one at a time in dependency order: a layer's deploy
//! may read outputs its prerequisites collected moments earlier. The
//! deployment state is persisted after every layer; persistence failures
//! are logged and the run continues.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use layerstack_state::{DeploymentState, FileStateStore, LayerOutput, StateStore};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use crate::config::StackConfig;
use crate::error::{diagnostic_tail, StackError, StackResult};
use crate::exec::{ProcessExecutor, TokioProcessExecutor};
use crate::graph::ConfigGraph;
use crate::health::{CommandRemoteExecutor, HealthOracle, HttpProbeClient};
use crate::layer::{LayerContext, LayerController, LayerPhase, LayerRegistry, LayerServices};
use crate::obs::{self, RunSpan};
use crate::source::CommandSourceFetcher;

const ERROR_TAIL_LINES: usize = 10;
const ERROR_TAIL_CHARS: usize = 1200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunOptions {
    /// Keep going after a layer fails instead of rolling back.
    pub continue_on_error: bool,
    /// Verify only; never deploy or touch the state.
    pub dry_run: bool,
    /// Deploy every layer without consulting verification.
    pub force: bool,
}

/// What happened to one layer during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerReport {
    pub layer: String,
    pub phase: LayerPhase,
    /// Verification verdict reason, when verification ran.
    pub reason: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    /// Dry runs only: verification asked for a deploy.
    pub would_deploy: bool,
}

impl LayerReport {
    fn new(layer: &str) -> Self {
        Self {
            layer: layer.to_string(),
            phase: LayerPhase::Unprocessed,
            reason: None,
            error: None,
            duration_ms: None,
            would_deploy: false,
        }
    }
}

/// Result of destroying one layer, during rollback or `destroy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyOutcome {
    pub layer: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub success: bool,
    /// First failure, naming the layer.
    pub error: Option<String>,
    pub order: Vec<String>,
    pub layers: Vec<LayerReport>,
    /// Rollback outcomes in the order they ran. Empty unless a failure
    /// aborted the run.
    pub rollback: Vec<DestroyOutcome>,
}

impl RunReport {
    pub fn layer(&self, name: &str) -> Option<&LayerReport> {
        self.layers.iter().find(|l| l.layer == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestroyReport {
    pub run_id: String,
    pub success: bool,
    pub order: Vec<String>,
    pub outcomes: Vec<DestroyOutcome>,
    /// The whole state document was removed.
    pub state_cleared: bool,
}

/// Per-run layer phases. Every change goes through [`PhaseTracker::advance`],
/// which rejects edges the lifecycle does not allow.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    phases: HashMap<String, LayerPhase>,
    deployed: HashSet<String>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, layer: &str) -> LayerPhase {
        self.phases
            .get(layer)
            .copied()
            .unwrap_or(LayerPhase::Unprocessed)
    }

    pub fn advance(&mut self, layer: &str, next: LayerPhase) -> StackResult<()> {
        let current = self.phase(layer);
        if !current.can_transition_to(next) {
            return Err(StackError::InvalidTransition {
                layer: layer.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        if next == LayerPhase::Deployed {
            self.deployed.insert(layer.to_string());
        }
        self.phases.insert(layer.to_string(), next);
        Ok(())
    }

    /// Whether this run's `deploy` succeeded for `layer`.
    pub fn deployed_this_run(&self, layer: &str) -> bool {
        self.deployed.contains(layer)
    }
}

pub struct Orchestrator {
    graph: ConfigGraph,
    controllers: BTreeMap<String, Arc<dyn LayerController>>,
    store: Arc<dyn StateStore>,
    state: DeploymentState,
    options: RunOptions,
}

impl Orchestrator {
    /// Build controllers for every enabled layer and load the persisted
    /// state. An unreadable state is logged and replaced by an empty one.
    pub async fn initialize(
        graph: ConfigGraph,
        registry: &LayerRegistry,
        services: &LayerServices,
        store: Arc<dyn StateStore>,
        options: RunOptions,
    ) -> StackResult<Self> {
        let mut controllers = BTreeMap::new();
        for def in graph.layers().iter().filter(|d| d.enabled) {
            let controller: Arc<dyn LayerController> = Arc::from(registry.build(def, services)?);
            controllers.insert(def.name.clone(), controller);
        }

        let state = match store.load().await {
            Ok(Some(state)) => state,
            Ok(None) => DeploymentState::new(),
            Err(e) => {
                warn!(location = %store.location(), error = %e, "cannot load deployment state; starting empty");
                DeploymentState::new()
            }
        };
        debug!(layers = controllers.len(), recorded = state.layers.len(), "orchestrator initialized");

        Ok(Self {
            graph,
            controllers,
            store,
            state,
            options,
        })
    }

    /// Wire the default collaborators for a loaded configuration file: the
    /// built-in kinds, real processes, HTTP probes, the configured remote
    /// channel and the JSON state file.
    pub async fn from_config(config: &StackConfig, mut options: RunOptions) -> StackResult<Self> {
        let registry = LayerRegistry::with_builtin();
        let defs = ConfigGraph::validate(&config.raw, |kind| registry.requires_source(kind))?;
        let graph = ConfigGraph::new(defs)?;

        let settings = config.settings();
        let executor: Arc<dyn ProcessExecutor> = Arc::new(TokioProcessExecutor);
        let oracle = HealthOracle::new(Arc::new(HttpProbeClient::new()), settings.health.clone())
            .with_remote(Arc::new(CommandRemoteExecutor::new(
                Arc::clone(&executor),
                settings.remote_exec.clone(),
            )));
        let fetcher = Arc::new(CommandSourceFetcher::new(
            Arc::clone(&executor),
            config.base_dir.clone(),
            config.source_cache(),
        ));
        let services = LayerServices {
            executor,
            oracle,
            fetcher,
        };
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(config.state_file()));

        options.continue_on_error |= settings.continue_on_error;
        Self::initialize(graph, &registry, &services, store, options).await
    }

    pub fn graph(&self) -> &ConfigGraph {
        &self.graph
    }

    pub fn state(&self) -> &DeploymentState {
        &self.state
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    /// Deploy `targets` and their prerequisites (every enabled layer when
    /// empty).
    pub async fn run(&mut self, targets: &[String]) -> StackResult<RunReport> {
        let options = self.options;
        self.execute("deploy", targets, options).await
    }

    /// Dry run: report which layers would deploy.
    pub async fn verify(&mut self, targets: &[String]) -> StackResult<RunReport> {
        let options = RunOptions {
            dry_run: true,
            ..self.options
        };
        self.execute("verify", targets, options).await
    }

    async fn execute(
        &mut self,
        command: &str,
        targets: &[String],
        options: RunOptions,
    ) -> StackResult<RunReport> {
        let run = RunSpan::new(command);
        let run_id = run.run_id().to_string();
        self.execute_inner(run_id, command, targets, options)
            .instrument(run.span())
            .await
    }

    async fn execute_inner(
        &mut self,
        run_id: String,
        command: &str,
        targets: &[String],
        options: RunOptions,
    ) -> StackResult<RunReport> {
        let started = Instant::now();
        let order = self.graph.required_closure(targets)?;
        obs::emit_run_started(&run_id, command, &order);

        let mut tracker = PhaseTracker::new();
        let mut reports: Vec<LayerReport> = Vec::with_capacity(order.len());
        let mut first_error: Option<String> = None;
        let mut rollback = Vec::new();

        for name in &order {
            let controller = self.controller(name)?;
            let ctx = self.context_for(name);
            let mut report = LayerReport::new(name);

            let verdict = if options.force {
                None
            } else {
                tracker.advance(name, LayerPhase::Verifying)?;
                let verdict = controller.verify(&ctx).await;
                obs::emit_layer_verified(name, verdict.skip, verdict.reason.as_deref());
                Some(verdict)
            };

            if let Some(verdict) = &verdict {
                report.reason = verdict.reason.clone();
                if verdict.skip {
                    tracker.advance(name, LayerPhase::Skipped)?;
                    report.phase = LayerPhase::Skipped;
                    if !options.dry_run {
                        self.record_existing(name, verdict.existing_output.clone()).await;
                    }
                    reports.push(report);
                    continue;
                }
            }

            if options.dry_run {
                report.phase = tracker.phase(name);
                report.would_deploy = true;
                reports.push(report);
                continue;
            }

            tracker.advance(name, LayerPhase::Deploying)?;
            info!(layer = %name, "deploying layer");
            let deployed = controller.deploy(&ctx).await;
            report.duration_ms = Some(deployed.duration.as_millis() as u64);

            let failure = if deployed.success {
                tracker.advance(name, LayerPhase::Deployed)?;
                obs::emit_layer_deployed(name, deployed.duration.as_millis() as u64);
                match controller.collect_outputs(&ctx).await {
                    Ok(output) => {
                        tracker.advance(name, LayerPhase::OutputsCollected)?;
                        report.phase = LayerPhase::OutputsCollected;
                        self.record_deployed(name, output).await;
                        reports.push(report);
                        continue;
                    }
                    Err(e) => format!("layer '{name}' deployed but collecting outputs failed: {e}"),
                }
            } else {
                format!(
                    "layer '{name}' failed to deploy: {}",
                    diagnostic_tail(
                        deployed.error.as_deref().unwrap_or("no error detail"),
                        ERROR_TAIL_LINES,
                        ERROR_TAIL_CHARS,
                    )
                )
            };

            tracker.advance(name, LayerPhase::Failed)?;
            obs::emit_layer_failed(name, &failure);
            if self.state.remove(name).is_some() {
                self.persist().await;
            }
            report.phase = LayerPhase::Failed;
            report.error = Some(failure.clone());
            reports.push(report);
            first_error.get_or_insert(failure);

            if !options.continue_on_error {
                rollback = self.rollback_failed_layers(&order, name, &mut tracker).await?;
                for report in reports.iter_mut() {
                    report.phase = tracker.phase(&report.layer);
                }
                break;
            }
        }

        if !options.dry_run {
            self.persist().await;
        }

        let success = first_error.is_none();
        let elapsed = started.elapsed().as_millis() as u64;
        obs::emit_run_finished(&run_id, elapsed, success);

        Ok(RunReport {
            run_id,
            success,
            error: first_error,
            order,
            layers: reports,
            rollback,
        })
    }

    /// Destroy what this run deployed before `failed_layer`, newest first.
    ///
    /// Only layers whose deploy succeeded in this run are touched; skipped
    /// layers existed before the run and are left alone. When `failed_layer`
    /// itself deployed (and then failed to report outputs) it is destroyed
    /// first.
    pub async fn rollback_failed_layers(
        &mut self,
        order: &[String],
        failed_layer: &str,
        tracker: &mut PhaseTracker,
    ) -> StackResult<Vec<DestroyOutcome>> {
        let position = order
            .iter()
            .position(|l| l == failed_layer)
            .unwrap_or(order.len());

        let mut targets: Vec<&String> = Vec::new();
        if let Some(failed) = order.get(position) {
            if tracker.deployed_this_run(failed) {
                targets.push(failed);
            }
        }
        targets.extend(
            order[..position]
                .iter()
                .rev()
                .filter(|l| tracker.deployed_this_run(l)),
        );
        if targets.is_empty() {
            info!(failed_layer, "nothing to roll back");
            return Ok(Vec::new());
        }
        warn!(failed_layer, layers = ?targets, "rolling back layers deployed by this run");

        let mut outcomes = Vec::with_capacity(targets.len());
        for name in targets {
            let controller = self.controller(name)?;
            let ctx = self.context_for(name);
            let result = controller.destroy(&ctx).await;
            obs::emit_rollback_layer(name, result.success, result.error.as_deref());
            if result.success {
                tracker.advance(name, LayerPhase::RolledBack)?;
                self.state.remove(name);
            }
            outcomes.push(DestroyOutcome {
                layer: name.clone(),
                success: result.success,
                error: result.error,
            });
        }
        self.persist().await;
        Ok(outcomes)
    }

    /// Tear down `targets` (every enabled layer when empty) in reverse
    /// dependency order. Failures are reported and do not stop the
    /// remaining layers. A full destroy clears the state document; a
    /// partial one removes the destroyed entries.
    pub async fn destroy(&mut self, targets: &[String]) -> StackResult<DestroyReport> {
        let run = RunSpan::new("destroy");
        let run_id = run.run_id().to_string();
        self.destroy_inner(run_id, targets).instrument(run.span()).await
    }

    async fn destroy_inner(&mut self, run_id: String, targets: &[String]) -> StackResult<DestroyReport> {
        let started = Instant::now();
        let wanted: HashSet<&str> = targets.iter().map(String::as_str).collect();
        for target in targets {
            let def = self
                .graph
                .definition(target)
                .ok_or_else(|| StackError::UnknownLayer {
                    layer: target.clone(),
                })?;
            if !def.enabled {
                return Err(StackError::DisabledDependency {
                    dependency: target.clone(),
                    required_by: "requested targets".to_string(),
                });
            }
        }

        let mut order: Vec<String> = self
            .graph
            .execution_order()?
            .into_iter()
            .filter(|l| wanted.is_empty() || wanted.contains(l.as_str()))
            .collect();
        order.reverse();
        let full = wanted.is_empty() || order.len() == self.controllers.len();
        obs::emit_run_started(&run_id, "destroy", &order);

        for name in &order {
            for dependent in self.graph.dependents_of(name) {
                if !wanted.is_empty()
                    && !wanted.contains(dependent)
                    && self.state.layer(dependent).is_some()
                {
                    warn!(layer = %name, dependent, "destroying a layer that a deployed layer depends on");
                }
            }
        }

        let mut outcomes = Vec::with_capacity(order.len());
        if self.options.dry_run {
            info!(layers = ?order, "dry run: nothing destroyed");
        } else {
            for name in &order {
                let controller = self.controller(name)?;
                let ctx = self.context_for(name);
                let result = controller.destroy(&ctx).await;
                obs::emit_layer_destroyed(name, result.success, result.error.as_deref());
                if result.success {
                    self.state.remove(name);
                }
                outcomes.push(DestroyOutcome {
                    layer: name.clone(),
                    success: result.success,
                    error: result.error,
                });
            }
        }

        let state_cleared = full && !self.options.dry_run;
        if state_cleared {
            self.state = DeploymentState::new();
            if let Err(e) = self.store.clear().await {
                obs::emit_state_persist_error(&self.store.location(), &e);
            }
        } else if !self.options.dry_run {
            self.persist().await;
        }

        let success = outcomes.iter().all(|o| o.success);
        obs::emit_run_finished(&run_id, started.elapsed().as_millis() as u64, success);
        Ok(DestroyReport {
            run_id,
            success,
            order,
            outcomes,
            state_cleared,
        })
    }

    fn controller(&self, name: &str) -> StackResult<Arc<dyn LayerController>> {
        self.controllers
            .get(name)
            .cloned()
            .ok_or_else(|| StackError::UnknownLayer {
                layer: name.to_string(),
            })
    }

    /// Recorded outputs of every transitive prerequisite of `name`.
    fn context_for(&self, name: &str) -> LayerContext {
        let upstream = self
            .graph
            .ancestors(name)
            .into_iter()
            .filter_map(|dep| {
                self.state
                    .layer(dep)
                    .map(|output| (dep.to_string(), output.clone()))
            })
            .collect();
        LayerContext::new(name, upstream)
    }

    /// A skip-verified layer keeps the previous run's `deployed` flag.
    async fn record_existing(&mut self, name: &str, existing: Option<LayerOutput>) {
        let previously_deployed = self.state.layer(name).is_some_and(|o| o.deployed);
        let mut output =
            existing.unwrap_or_else(|| LayerOutput::new(name, false, BTreeMap::new()));
        output.layer_name = name.to_string();
        output.deployed = previously_deployed;
        self.state.record(output.stamped(Utc::now()));
        self.persist().await;
    }

    async fn record_deployed(&mut self, name: &str, mut output: LayerOutput) {
        output.layer_name = name.to_string();
        output.deployed = true;
        self.state.record(output.stamped(Utc::now()));
        self.persist().await;
    }

    async fn persist(&mut self) {
        self.state.touch();
        if let Err(e) = self.store.save(&self.state).await {
            obs::emit_state_persist_error(&self.store.location(), &e);
        }
    }
}
