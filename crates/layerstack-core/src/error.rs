//! Error types for the layer lifecycle engine.
//!
//! `StackError` covers failures that abort a command before (or instead of)
//! processing layers. Everything a single layer can get wrong at runtime is
//! a value instead (`DeployResult`, `DestroyResult`, `HealthCheckResult`,
//! [`LayerError`]).

use std::path::PathBuf;

use thiserror::Error;

/// Fatal engine errors.
#[derive(Debug, Error)]
pub enum StackError {
    /// The configuration file could not be read or parsed.
    #[error("cannot load configuration {path}: {reason}")]
    ConfigLoad { path: PathBuf, reason: String },

    /// A layer definition is invalid. `field` is the dotted path of the
    /// offending key, e.g. `layers.api.depends_on[1]`.
    #[error("invalid configuration at {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    /// The dependency relation contains a cycle through `layer`.
    #[error("cyclic dependency detected at layer '{layer}'")]
    CyclicDependency { layer: String },

    /// A requested layer is not declared.
    #[error("unknown layer '{layer}'")]
    UnknownLayer { layer: String },

    /// A required layer (target or transitive prerequisite) is disabled.
    #[error("layer '{dependency}' is required by '{required_by}' but is disabled")]
    DisabledDependency {
        dependency: String,
        required_by: String,
    },

    /// No factory is registered for a deployment kind.
    #[error("layer '{layer}' uses unknown deployment kind '{kind}'")]
    UnknownKind { layer: String, kind: String },

    /// The per-layer state machine was driven through an illegal edge.
    #[error("layer '{layer}' cannot move from {from} to {to}")]
    InvalidTransition {
        layer: String,
        from: String,
        to: String,
    },
}

/// Result type for engine operations.
pub type StackResult<T> = std::result::Result<T, StackError>;

/// Failures inside a layer controller. `collect_outputs` returns them;
/// the other operations fold them into their result values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    /// A command exited non-zero or could not run.
    #[error("command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    /// Output text could not be parsed into key/value pairs.
    #[error("cannot parse outputs: {0}")]
    OutputParse(String),

    /// The layer's source tree could not be materialised.
    #[error("source unavailable: {0}")]
    Source(String),

    /// A `${layer.key}` placeholder referenced a value that does not exist.
    #[error("unresolved placeholder {0}")]
    Unresolved(String),

    /// Output collection did not finish inside its time budget.
    #[error("output collection timed out after {0}s")]
    Timeout(u64),
}

/// Failures running an external process.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {millis}ms")]
    Timeout { program: String, millis: u64 },

    #[error("waiting for {program} failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with code {code}: {detail}")]
    Failed {
        program: String,
        code: i32,
        detail: String,
    },
}

/// Keep only the last `max_lines` lines (and at most `max_chars` characters)
/// of a diagnostic blob, for user-facing failure messages.
pub fn diagnostic_tail(text: &str, max_lines: usize, max_chars: usize) -> String {
    let trimmed = text.trim_end();
    let lines: Vec<&str> = trimmed.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    let mut tail = lines[start..].join("\n");
    if tail.chars().count() > max_chars {
        let skip = tail.chars().count() - max_chars;
        tail = tail.chars().skip(skip).collect();
        tail.insert_str(0, "...");
    } else if start > 0 {
        tail.insert_str(0, "...\n");
    }
    tail
}
