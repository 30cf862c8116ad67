//! HealthOracle behaviour: polling cadence, tier escalation and fan-out.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{services, StaticProbe};
use layerstack_core::error::ExecError;
use layerstack_core::health::{ProbeClient, ProbeError, ProbeResponse, RemoteExecutor};
use layerstack_core::{
    EndpointDescriptor, HealthCheckResult, HealthOracle, HealthPolicy, LayerContext, LayerController,
    LayerDefinition, LayerRegistry, LayerServices, ProbeTier, RemoteProbe,
};
use tokio::time::Instant;

/// Unreachable for the first `failures` calls, healthy afterwards.
struct FlakyProbe {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyProbe {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProbeClient for FlakyProbe {
    async fn get(&self, _url: &str, _timeout: Duration) -> Result<ProbeResponse, ProbeError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(ProbeError::Unreachable("connection refused".into()))
        } else {
            Ok(ProbeResponse::ok(r#"{"status":"ok"}"#))
        }
    }
}

/// Returns fixed marker output and remembers what it was asked to run.
struct MarkerRemote {
    output: String,
    scripts: Mutex<Vec<(String, String)>>,
}

impl MarkerRemote {
    fn new(output: &str) -> Arc<Self> {
        Arc::new(Self {
            output: output.to_string(),
            scripts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteExecutor for MarkerRemote {
    async fn exec(
        &self,
        handle: &str,
        script: &str,
        _timeout: Duration,
    ) -> Result<String, ExecError> {
        self.scripts
            .lock()
            .unwrap()
            .push((handle.to_string(), script.to_string()));
        Ok(self.output.clone())
    }
}

fn endpoint() -> EndpointDescriptor {
    EndpointDescriptor::new("api", "http://10.0.0.5:8080")
}

fn remote_endpoint() -> EndpointDescriptor {
    let mut ep = endpoint();
    ep.remote = Some(RemoteProbe {
        handle: "admin@10.0.0.5".to_string(),
        process: Some("api-server".to_string()),
        dependency_url: Some("http://db:5432".to_string()),
        ports: vec![8080],
        health_url: Some("http://127.0.0.1:8080/health".to_string()),
    });
    ep
}

const TIMEOUT: Duration = Duration::from_secs(60);
const INTERVAL: Duration = Duration::from_millis(1000);

// ---------------------------------------------------------------------------
// wait_until_healthy
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fifth_attempt_healthy_after_exactly_four_seconds() {
    let probe = FlakyProbe::new(4);
    let oracle = HealthOracle::new(probe.clone(), HealthPolicy::default());

    let start = Instant::now();
    let result = oracle
        .wait_until_healthy(&endpoint(), 5, INTERVAL, TIMEOUT)
        .await;

    assert!(result.healthy);
    assert_eq!(probe.calls(), 5);
    assert_eq!(start.elapsed(), Duration::from_millis(4000));
}

#[tokio::test(start_paused = true)]
async fn all_attempts_unhealthy_times_out_without_sixth_attempt() {
    let probe = FlakyProbe::new(usize::MAX);
    let oracle = HealthOracle::new(probe.clone(), HealthPolicy::default());

    let start = Instant::now();
    let result = oracle
        .wait_until_healthy(&endpoint(), 5, INTERVAL, TIMEOUT)
        .await;

    assert!(!result.healthy);
    assert_eq!(probe.calls(), 5);
    assert_eq!(start.elapsed(), Duration::from_millis(4000));
    let error = result.error.unwrap();
    assert!(error.contains("5 attempt(s)"), "{error}");
    assert!(error.contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn first_healthy_attempt_returns_immediately() {
    let probe = FlakyProbe::new(0);
    let oracle = HealthOracle::new(probe.clone(), HealthPolicy::default());
    let start = Instant::now();
    let result = oracle
        .wait_until_healthy(&endpoint(), 5, INTERVAL, TIMEOUT)
        .await;
    assert!(result.healthy);
    assert_eq!(probe.calls(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

// ---------------------------------------------------------------------------
// Tier 2
// ---------------------------------------------------------------------------

async fn remote_verdict(markers: &str) -> HealthCheckResult {
    let oracle = HealthOracle::new(FlakyProbe::new(usize::MAX), HealthPolicy::default())
        .with_remote(MarkerRemote::new(markers));
    oracle.check_endpoint(&remote_endpoint(), TIMEOUT).await
}

#[tokio::test]
async fn three_of_four_markers_is_healthy() {
    let result = remote_verdict(
        "PROCESS_RUNNING=1\nDEPENDENCY_REACHABLE=1\nPORTS_LISTENING=1\nSELF_HEALTHY=0\n",
    )
    .await;
    assert!(result.healthy);
    assert_eq!(result.tier, ProbeTier::Remote);
    assert_eq!(result.confidence, 0.75);
}

#[tokio::test]
async fn two_of_four_markers_without_self_report_is_unhealthy() {
    let result = remote_verdict(
        "PROCESS_RUNNING=1\nDEPENDENCY_REACHABLE=0\nPORTS_LISTENING=1\nSELF_HEALTHY=0\n",
    )
    .await;
    assert!(!result.healthy);
    assert_eq!(result.confidence, 0.5);
    let error = result.error.unwrap();
    assert!(error.contains("connection refused"), "keeps tier-1 error: {error}");
    assert!(error.contains("0.50"));
}

#[tokio::test]
async fn self_report_alone_is_healthy() {
    let result = remote_verdict(
        "PROCESS_RUNNING=0\nDEPENDENCY_REACHABLE=0\nPORTS_LISTENING=0\nSELF_HEALTHY=1\n",
    )
    .await;
    assert!(result.healthy);
    assert_eq!(result.confidence, 0.25);
}

#[tokio::test]
async fn remote_tier_receives_the_diagnostic_script() {
    let remote = MarkerRemote::new("SELF_HEALTHY=1");
    let oracle = HealthOracle::new(FlakyProbe::new(usize::MAX), HealthPolicy::default())
        .with_remote(remote.clone());
    oracle.check_endpoint(&remote_endpoint(), TIMEOUT).await;

    let scripts = remote.scripts.lock().unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].0, "admin@10.0.0.5");
    assert!(scripts[0].1.contains("pgrep -f 'api-server'"));
    assert!(scripts[0].1.contains("SELF_HEALTHY"));
}

#[tokio::test]
async fn reachable_endpoint_never_escalates() {
    let remote = MarkerRemote::new("SELF_HEALTHY=1");
    let oracle = HealthOracle::new(FlakyProbe::new(0), HealthPolicy::default())
        .with_remote(remote.clone());
    let result = oracle.check_endpoint(&remote_endpoint(), TIMEOUT).await;
    assert!(result.healthy);
    assert_eq!(result.tier, ProbeTier::Direct);
    assert_eq!(remote.calls(), 0);
}

#[tokio::test]
async fn escalation_needs_a_remote_handle() {
    let remote = MarkerRemote::new("SELF_HEALTHY=1");
    let oracle = HealthOracle::new(FlakyProbe::new(usize::MAX), HealthPolicy::default())
        .with_remote(remote.clone());
    let result = oracle.check_endpoint(&endpoint(), TIMEOUT).await;
    assert!(!result.healthy);
    assert_eq!(result.tier, ProbeTier::Direct);
    assert_eq!(remote.calls(), 0);
}

#[tokio::test]
async fn threshold_is_configurable() {
    let policy = HealthPolicy {
        remote_threshold: 0.8,
        ..HealthPolicy::default()
    };
    let oracle = HealthOracle::new(FlakyProbe::new(usize::MAX), policy).with_remote(
        MarkerRemote::new("PROCESS_RUNNING=1\nDEPENDENCY_REACHABLE=1\nPORTS_LISTENING=1\n"),
    );
    let result = oracle.check_endpoint(&remote_endpoint(), TIMEOUT).await;
    assert!(!result.healthy);
}

// ---------------------------------------------------------------------------
// check_multiple
// ---------------------------------------------------------------------------

/// Sleeps per URL and tracks how many probes run at once.
struct SlowProbe {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl ProbeClient for SlowProbe {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<ProbeResponse, ProbeError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = if url.contains("slow") { 30_000 } else { 100 };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ProbeResponse::ok("{}"))
    }
}

fn slow_probe() -> Arc<SlowProbe> {
    Arc::new(SlowProbe {
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    })
}

#[tokio::test(start_paused = true)]
async fn check_multiple_bounds_concurrency_and_keeps_order() {
    let probe = slow_probe();
    let policy = HealthPolicy {
        max_concurrent_probes: 2,
        ..HealthPolicy::default()
    };
    let oracle = HealthOracle::new(probe.clone(), policy);
    let endpoints: Vec<EndpointDescriptor> = (0..6)
        .map(|i| EndpointDescriptor::new(format!("svc-{i}"), format!("http://svc-{i}")))
        .collect();

    let report = oracle.check_multiple(&endpoints, Duration::from_secs(5)).await;

    assert!(report.overall);
    let order: Vec<&str> = report.results.iter().map(|r| r.endpoint.as_str()).collect();
    assert_eq!(order, vec!["svc-0", "svc-1", "svc-2", "svc-3", "svc-4", "svc-5"]);
    assert!(probe.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(start_paused = true)]
async fn check_multiple_reports_partial_results_at_deadline() {
    let oracle = HealthOracle::new(slow_probe(), HealthPolicy::default());
    let endpoints = vec![
        EndpointDescriptor::new("fast", "http://fast"),
        EndpointDescriptor::new("slow", "http://slow"),
    ];

    let report = oracle.check_multiple(&endpoints, Duration::from_secs(2)).await;

    assert!(!report.overall);
    assert!(report.results[0].result.healthy);
    assert!(!report.results[1].result.healthy);
    assert!(report.failure_summary().starts_with("slow:"));
}

// ---------------------------------------------------------------------------
// Verification idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn external_layer_verify_is_repeatable() {
    let mut svc: LayerServices = services();
    svc.oracle = HealthOracle::new(
        Arc::new(StaticProbe(Err(ProbeError::Unreachable("no route to host".into())))),
        HealthPolicy::default(),
    );
    let mut def = LayerDefinition::new("registry", "external", &[]);
    def.deployment.spec = serde_json::json!({
        "kind": "external",
        "endpoints": [{"name": "registry", "url": "http://registry.internal"}],
        "outputs": {"url": "http://registry.internal"}
    });
    let controller = LayerRegistry::with_builtin().build(&def, &svc).unwrap();

    let ctx = LayerContext::default();
    let first = controller.verify(&ctx).await;
    let second = controller.verify(&ctx).await;
    assert!(!first.skip);
    assert_eq!(first, second);
}
