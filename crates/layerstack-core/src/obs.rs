//! Structured lifecycle events for layerstack runs.
//!
//! Every orchestrator command runs inside a span tagged with a fresh run id.
//! Layer transitions are emitted as `info!` events with an `event` field so
//! they can be filtered in JSON log pipelines.

use tracing::{info, warn};
use uuid::Uuid;

/// Run-scoped span. Attach it to the command's future with
/// `tracing::Instrument` so it stays `Send`.
pub struct RunSpan {
    run_id: String,
    span: tracing::Span,
}

impl RunSpan {
    pub fn new(command: &str) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("layerstack.run", run_id = %run_id, command = %command);
        Self { run_id, span }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }
}

pub fn emit_run_started(run_id: &str, command: &str, layers: &[String]) {
    info!(event = "run.started", run_id = %run_id, command = %command, layers = ?layers);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_layer_verified(layer: &str, skip: bool, reason: Option<&str>) {
    info!(event = "layer.verified", layer = %layer, skip = skip, reason = reason.unwrap_or(""));
}

pub fn emit_layer_deployed(layer: &str, duration_ms: u64) {
    info!(event = "layer.deployed", layer = %layer, duration_ms = duration_ms);
}

pub fn emit_layer_failed(layer: &str, error: &str) {
    warn!(event = "layer.failed", layer = %layer, error = %error);
}

pub fn emit_rollback_layer(layer: &str, success: bool, error: Option<&str>) {
    info!(event = "rollback.layer", layer = %layer, success = success, error = error.unwrap_or(""));
}

pub fn emit_layer_destroyed(layer: &str, success: bool, error: Option<&str>) {
    info!(event = "layer.destroyed", layer = %layer, success = success, error = error.unwrap_or(""));
}

/// State persistence failures never abort a run.
pub fn emit_state_persist_error(location: &str, error: &dyn std::fmt::Display) {
    warn!(event = "state.persist_error", location = %location, error = %error);
}
