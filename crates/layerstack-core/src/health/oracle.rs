//! Health oracle: single checks, polling and bounded fan-out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::probe::{ProbeClient, ProbeError};
use super::remote::{diagnostic_script, Markers, RemoteExecutor};
use super::{
    EndpointDescriptor, EndpointHealth, HealthCheckResult, HealthPolicy, MultiHealthReport,
    ProbeTier, RemoteProbe,
};

/// Why tier 1 rejected an endpoint.
struct DirectFailure {
    unreachable: bool,
    message: String,
}

impl DirectFailure {
    fn from_probe(query: &str, err: ProbeError) -> Self {
        Self {
            unreachable: err.is_unreachable(),
            message: format!("{query}: {err}"),
        }
    }

    fn rejected(message: String) -> Self {
        Self {
            unreachable: false,
            message,
        }
    }
}

/// Verifies endpoints. Cheap to clone; clones share the probe client and
/// remote executor.
#[derive(Clone)]
pub struct HealthOracle {
    client: Arc<dyn ProbeClient>,
    remote: Option<Arc<dyn RemoteExecutor>>,
    policy: HealthPolicy,
}

impl HealthOracle {
    pub fn new(client: Arc<dyn ProbeClient>, policy: HealthPolicy) -> Self {
        Self {
            client,
            remote: None,
            policy,
        }
    }

    /// Enable tier-2 probing through `remote`.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteExecutor>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// One verdict for `endpoint` within `timeout`.
    ///
    /// Tier 2 runs only when the liveness query could not reach the endpoint,
    /// a remote executor is configured and the descriptor names a remote
    /// handle. It gets whatever is left of `timeout`.
    pub async fn check_endpoint(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> HealthCheckResult {
        let start = Instant::now();
        let deadline = start + timeout;

        let failure = match self.check_direct(endpoint, deadline).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(endpoint = %endpoint.name, elapsed_ms = elapsed, "direct probe healthy");
                return HealthCheckResult::healthy(ProbeTier::Direct, elapsed, 1.0);
            }
            Err(failure) => failure,
        };

        if failure.unreachable {
            if let (Some(remote), Some(probe)) = (&self.remote, &endpoint.remote) {
                if deadline > Instant::now() {
                    return self
                        .check_remote(endpoint, remote.as_ref(), probe, &failure, start, deadline)
                        .await;
                }
            }
        }

        HealthCheckResult::unhealthy(
            ProbeTier::Direct,
            start.elapsed().as_millis() as u64,
            failure.message,
        )
    }

    async fn check_direct(
        &self,
        endpoint: &EndpointDescriptor,
        deadline: Instant,
    ) -> Result<(), DirectFailure> {
        let liveness = endpoint.query_url(&endpoint.liveness);
        let response = self.query(&liveness, deadline).await?;
        if !response.is_success() {
            return Err(DirectFailure::rejected(format!(
                "{liveness}: HTTP {}",
                response.status
            )));
        }
        if serde_json::from_str::<serde_json::Value>(&response.body).is_err() {
            return Err(DirectFailure::rejected(format!(
                "{liveness}: response is not valid JSON"
            )));
        }

        for path in &endpoint.functional {
            let url = endpoint.query_url(path);
            let response = match self.query(&url, deadline).await {
                Ok(r) => r,
                // The liveness query already answered, so a failure here is
                // a functional failure, not an unreachable endpoint.
                Err(mut failure) => {
                    failure.unreachable = false;
                    return Err(failure);
                }
            };
            if !response.is_success() {
                return Err(DirectFailure::rejected(format!(
                    "{url}: HTTP {}",
                    response.status
                )));
            }
        }

        for path in &endpoint.informational {
            let url = endpoint.query_url(path);
            match self.query(&url, deadline).await {
                Ok(r) if r.is_success() => {}
                Ok(r) => warn!(endpoint = %endpoint.name, url = %url, status = r.status, "informational query failed"),
                Err(failure) => warn!(endpoint = %endpoint.name, error = %failure.message, "informational query failed"),
            }
        }

        Ok(())
    }

    async fn query(
        &self,
        url: &str,
        deadline: Instant,
    ) -> Result<super::ProbeResponse, DirectFailure> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DirectFailure::from_probe(url, ProbeError::Timeout(0)));
        }
        let budget = remaining.min(self.policy.probe_timeout());
        match tokio::time::timeout(budget, self.client.get(url, budget)).await {
            Ok(result) => result.map_err(|e| DirectFailure::from_probe(url, e)),
            Err(_) => Err(DirectFailure::from_probe(
                url,
                ProbeError::Timeout(budget.as_millis() as u64),
            )),
        }
    }

    async fn check_remote(
        &self,
        endpoint: &EndpointDescriptor,
        remote: &dyn RemoteExecutor,
        probe: &RemoteProbe,
        direct: &DirectFailure,
        start: Instant,
        deadline: Instant,
    ) -> HealthCheckResult {
        debug!(endpoint = %endpoint.name, handle = %probe.handle, "escalating to remote probe");
        let remaining = deadline.saturating_duration_since(Instant::now());
        let script = diagnostic_script(probe);
        let output = match tokio::time::timeout(
            remaining,
            remote.exec(&probe.handle, &script, remaining),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return HealthCheckResult::unhealthy(
                    ProbeTier::Remote,
                    start.elapsed().as_millis() as u64,
                    format!("{}; remote probe failed: {e}", direct.message),
                )
            }
            Err(_) => {
                return HealthCheckResult::unhealthy(
                    ProbeTier::Remote,
                    start.elapsed().as_millis() as u64,
                    format!(
                        "{}; remote probe did not answer within the {}ms check budget",
                        direct.message,
                        deadline.duration_since(start).as_millis()
                    ),
                )
            }
        };

        let markers = Markers::parse(&output);
        let weights = &self.policy.marker_weights;
        let score = markers.score(weights);
        let elapsed = start.elapsed().as_millis() as u64;
        debug!(endpoint = %endpoint.name, ?markers, score, "remote markers scored");

        if markers.is_healthy(weights, self.policy.remote_threshold) {
            HealthCheckResult::healthy(ProbeTier::Remote, elapsed, score)
        } else {
            let mut result = HealthCheckResult::unhealthy(
                ProbeTier::Remote,
                elapsed,
                format!(
                    "{}; remote markers scored {score:.2} (threshold {:.2})",
                    direct.message, self.policy.remote_threshold
                ),
            );
            result.confidence = score;
            result
        }
    }

    /// Poll `endpoint` at a fixed interval until healthy.
    ///
    /// At most `max_retries` attempts, never past `timeout`, no sleep after
    /// the final attempt.
    pub async fn wait_until_healthy(
        &self,
        endpoint: &EndpointDescriptor,
        max_retries: u32,
        interval: Duration,
        timeout: Duration,
    ) -> HealthCheckResult {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut last_error: Option<String> = None;
        let mut attempts = 0;

        while attempts < max_retries {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;
            let result = self.check_endpoint(endpoint, remaining).await;
            if result.healthy {
                debug!(endpoint = %endpoint.name, attempts, "endpoint healthy");
                return result;
            }
            debug!(endpoint = %endpoint.name, attempt = attempts, error = ?result.error, "endpoint not healthy yet");
            last_error = result.error;

            if attempts < max_retries {
                if Instant::now() + interval >= deadline {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
        }

        let elapsed = start.elapsed();
        HealthCheckResult::unhealthy(
            ProbeTier::None,
            elapsed.as_millis() as u64,
            format!(
                "{} not healthy after {attempts} attempt(s) in {}ms: {}",
                endpoint.name,
                elapsed.as_millis(),
                last_error.as_deref().unwrap_or("no attempt completed")
            ),
        )
    }

    /// Check every endpoint concurrently (at most `max_concurrent_probes` at
    /// a time) and join on `timeout`. Endpoints that did not report in time
    /// get a timeout result. Results keep input order.
    pub async fn check_multiple(
        &self,
        endpoints: &[EndpointDescriptor],
        timeout: Duration,
    ) -> MultiHealthReport {
        let semaphore = Arc::new(Semaphore::new(self.policy.max_concurrent_probes.max(1)));
        let deadline = Instant::now() + timeout;
        let mut join_set = JoinSet::new();

        for (idx, endpoint) in endpoints.iter().cloned().enumerate() {
            let oracle = self.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let remaining = deadline.saturating_duration_since(Instant::now());
                let result = AssertUnwindSafe(oracle.check_endpoint(&endpoint, remaining))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        HealthCheckResult::unhealthy(
                            ProbeTier::None,
                            0,
                            format!(
                                "health check of {} panicked: {}",
                                endpoint.name,
                                panic_message(panic.as_ref())
                            ),
                        )
                    });
                (idx, result)
            });
        }

        let mut ordered: Vec<Option<HealthCheckResult>> = vec![None; endpoints.len()];
        loop {
            match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((idx, result)))) => ordered[idx] = Some(result),
                Ok(Some(Err(e))) => warn!(error = %e, "health probe task cancelled"),
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = join_set.len(), "health probes still running at deadline");
                    join_set.abort_all();
                    break;
                }
            }
        }

        let results: Vec<EndpointHealth> = endpoints
            .iter()
            .zip(ordered)
            .map(|(endpoint, slot)| EndpointHealth {
                endpoint: endpoint.name.clone(),
                result: slot.unwrap_or_else(|| HealthCheckResult::timed_out(timeout)),
            })
            .collect();
        let overall = results.iter().all(|r| r.result.healthy);

        MultiHealthReport { overall, results }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
