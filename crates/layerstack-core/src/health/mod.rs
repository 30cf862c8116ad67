//! Tiered health verification.
//!
//! Tier 1 talks to an endpoint directly (liveness, functional and
//! informational HTTP queries). Tier 2 runs a diagnostic script on the
//! instance over a remote execution channel and scores the markers it
//! prints. Tier 2 is only attempted when tier 1 could not reach the
//! endpoint at all.

pub mod oracle;
pub mod probe;
pub mod remote;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use oracle::HealthOracle;
pub use probe::{HttpProbeClient, ProbeClient, ProbeError, ProbeResponse};
pub use remote::{CommandRemoteExecutor, Markers, RemoteExecutor};

/// Relative weight of each tier-2 marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerWeights {
    pub process_running: f64,
    pub dependency_reachable: f64,
    pub ports_listening: f64,
    pub self_healthy: f64,
}

impl Default for MarkerWeights {
    fn default() -> Self {
        Self {
            process_running: 1.0,
            dependency_reachable: 1.0,
            ports_listening: 1.0,
            self_healthy: 1.0,
        }
    }
}

/// Retry, timeout and scoring knobs for health verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Attempts made by `wait_until_healthy`.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub interval_ms: u64,
    /// Hard outer budget for `wait_until_healthy` and `check_multiple`.
    pub timeout_ms: u64,
    /// Budget for a single HTTP query.
    pub probe_timeout_ms: u64,
    /// Weighted marker fraction at or above which tier 2 reports healthy.
    pub remote_threshold: f64,
    pub max_concurrent_probes: usize,
    pub marker_weights: MarkerWeights,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            interval_ms: 1000,
            timeout_ms: 60_000,
            probe_timeout_ms: 10_000,
            remote_threshold: 0.6,
            max_concurrent_probes: 8,
            marker_weights: MarkerWeights::default(),
        }
    }
}

impl HealthPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Which tier produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeTier {
    Direct,
    Remote,
    /// No probe ran (e.g. the budget was already spent).
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub tier: ProbeTier,
    /// 1.0 or 0.0 for direct probes, the weighted marker score for remote ones.
    pub confidence: f64,
}

impl HealthCheckResult {
    pub fn healthy(tier: ProbeTier, response_time_ms: u64, confidence: f64) -> Self {
        Self {
            healthy: true,
            response_time_ms,
            error: None,
            tier,
            confidence,
        }
    }

    pub fn unhealthy(tier: ProbeTier, response_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            response_time_ms,
            error: Some(error.into()),
            tier,
            confidence: 0.0,
        }
    }

    pub fn timed_out(elapsed: Duration) -> Self {
        Self::unhealthy(
            ProbeTier::None,
            elapsed.as_millis() as u64,
            format!("health check timed out after {}ms", elapsed.as_millis()),
        )
    }
}

/// What to ask an instance for over the remote channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProbe {
    /// Opaque instance handle understood by the remote executor.
    pub handle: String,
    /// `pgrep -f` pattern for the service process.
    #[serde(default)]
    pub process: Option<String>,
    /// URL of an upstream dependency the instance must be able to reach.
    #[serde(default)]
    pub dependency_url: Option<String>,
    /// Ports that must be listening on the instance.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// The service's own health URL as seen from inside the instance.
    #[serde(default)]
    pub health_url: Option<String>,
}

/// A probe-able service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub name: String,
    /// Base URL; query paths are appended to it.
    pub url: String,
    #[serde(default = "default_liveness")]
    pub liveness: String,
    /// Queries that must all succeed.
    #[serde(default)]
    pub functional: Vec<String>,
    /// Queries whose failure is only logged.
    #[serde(default)]
    pub informational: Vec<String>,
    #[serde(default)]
    pub remote: Option<RemoteProbe>,
}

fn default_liveness() -> String {
    "/health".to_string()
}

impl EndpointDescriptor {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            liveness: default_liveness(),
            functional: Vec::new(),
            informational: Vec::new(),
            remote: None,
        }
    }

    /// Absolute URL for a query path. Absolute `http(s)://` paths are used as-is.
    pub fn query_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.url.trim_end_matches('/');
        if path.is_empty() {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub result: HealthCheckResult,
}

/// Outcome of `check_multiple`: per-endpoint results in input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiHealthReport {
    pub overall: bool,
    pub results: Vec<EndpointHealth>,
}

impl MultiHealthReport {
    /// `name: error` for every unhealthy endpoint, joined with `; `.
    pub fn failure_summary(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.result.healthy)
            .map(|r| {
                format!(
                    "{}: {}",
                    r.endpoint,
                    r.result.error.as_deref().unwrap_or("unhealthy")
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
