//! Layerstack Core Library
//!
//! Dependency-ordered deployment of infrastructure layers: resolve the layer
//! graph, verify what already exists, deploy what is missing, collect
//! outputs for downstream layers and roll back on failure.

pub mod config;
pub mod error;
pub mod exec;
pub mod graph;
pub mod health;
pub mod layer;
pub mod obs;
pub mod orchestrator;
pub mod source;
pub mod telemetry;

pub use config::{RawLayer, RawStackConfig, Settings, StackConfig};
pub use error::{ExecError, LayerError, StackError, StackResult};
pub use exec::{ExecOptions, ProcessExecutor, ProcessOutput, TokioProcessExecutor};
pub use graph::{ConfigGraph, DeploymentDescriptor, LayerDefinition};
pub use health::{
    EndpointDescriptor, HealthCheckResult, HealthOracle, HealthPolicy, MultiHealthReport,
    ProbeTier, RemoteProbe,
};
pub use layer::{
    DeployResult, DestroyResult, LayerContext, LayerController, LayerPhase, LayerRegistry,
    LayerServices, VerifyResult,
};
pub use orchestrator::{
    DestroyOutcome, DestroyReport, LayerReport, Orchestrator, PhaseTracker, RunOptions, RunReport,
};
pub use source::{CommandSourceFetcher, SourceFetcher, SourceRef};
pub use telemetry::init_tracing;

pub use layerstack_state::{
    DeploymentState, FileStateStore, LayerOutput, MemoryStateStore, StateStore,
};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
