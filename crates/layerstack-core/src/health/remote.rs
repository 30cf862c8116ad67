//! Remote-execution (tier 2) probing.
//!
//! The diagnostic script prints one `MARKER=0|1` line per check:
//!
//! ```text
//! PROCESS_RUNNING=1
//! DEPENDENCY_REACHABLE=1
//! PORTS_LISTENING=0
//! SELF_HEALTHY=0
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{MarkerWeights, RemoteProbe};
use crate::error::{diagnostic_tail, ExecError};
use crate::exec::{ExecOptions, ProcessExecutor};

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `script` on the instance addressed by `handle`, returning stdout.
    async fn exec(&self, handle: &str, script: &str, timeout: Duration)
        -> Result<String, ExecError>;
}

/// Pipes the script into a configurable command such as
/// `ssh {handle} sh -s`.
pub struct CommandRemoteExecutor {
    executor: Arc<dyn ProcessExecutor>,
    template: Vec<String>,
}

impl CommandRemoteExecutor {
    pub fn new(executor: Arc<dyn ProcessExecutor>, template: Vec<String>) -> Self {
        Self { executor, template }
    }

    fn command_for(&self, handle: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|part| part.replace("{handle}", handle))
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for CommandRemoteExecutor {
    async fn exec(
        &self,
        handle: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<String, ExecError> {
        let command = self.command_for(handle);
        let (program, args) = crate::exec::split_command(&command)?;
        let opts = ExecOptions::default()
            .with_stdin(script)
            .with_timeout(timeout);
        let out = self.executor.run(program, args, &opts).await?;
        if !out.success() && out.stdout.trim().is_empty() {
            return Err(ExecError::Failed {
                program: program.to_string(),
                code: out.exit_code,
                detail: diagnostic_tail(&out.stderr, 5, 400),
            });
        }
        Ok(out.stdout)
    }
}

/// Tier-2 observations. Unconfigured checks report `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Markers {
    pub process_running: bool,
    pub dependency_reachable: bool,
    pub ports_listening: bool,
    pub self_healthy: bool,
}

impl Markers {
    /// Parse `KEY=value` lines. Unknown keys and noise lines are ignored.
    pub fn parse(output: &str) -> Self {
        let mut markers = Markers::default();
        for line in output.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let on = matches!(value.trim(), "1" | "true" | "yes");
            match key.trim() {
                "PROCESS_RUNNING" => markers.process_running = on,
                "DEPENDENCY_REACHABLE" => markers.dependency_reachable = on,
                "PORTS_LISTENING" => markers.ports_listening = on,
                "SELF_HEALTHY" => markers.self_healthy = on,
                _ => {}
            }
        }
        markers
    }

    /// Weighted fraction of markers that are set, in `[0, 1]`.
    pub fn score(&self, weights: &MarkerWeights) -> f64 {
        let parts = [
            (self.process_running, weights.process_running),
            (self.dependency_reachable, weights.dependency_reachable),
            (self.ports_listening, weights.ports_listening),
            (self.self_healthy, weights.self_healthy),
        ];
        let total: f64 = parts.iter().map(|(_, w)| w.max(0.0)).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let set: f64 = parts
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, w)| w.max(0.0))
            .sum();
        set / total
    }

    /// The self-reported marker alone is sufficient; otherwise the score
    /// must reach `threshold`.
    pub fn is_healthy(&self, weights: &MarkerWeights, threshold: f64) -> bool {
        self.self_healthy || self.score(weights) >= threshold
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the canonical diagnostic script for `probe`.
pub fn diagnostic_script(probe: &RemoteProbe) -> String {
    let mut script = String::from("set +e\n");

    match &probe.process {
        Some(pattern) => script.push_str(&format!(
            "if pgrep -f {} >/dev/null 2>&1; then echo PROCESS_RUNNING=1; else echo PROCESS_RUNNING=0; fi\n",
            shell_quote(pattern)
        )),
        None => script.push_str("echo PROCESS_RUNNING=0\n"),
    }

    match &probe.dependency_url {
        Some(url) => script.push_str(&format!(
            "if curl -fsS -m 5 -o /dev/null {} >/dev/null 2>&1; then echo DEPENDENCY_REACHABLE=1; else echo DEPENDENCY_REACHABLE=0; fi\n",
            shell_quote(url)
        )),
        None => script.push_str("echo DEPENDENCY_REACHABLE=0\n"),
    }

    if probe.ports.is_empty() {
        script.push_str("echo PORTS_LISTENING=0\n");
    } else {
        let ports = probe
            .ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        script.push_str(&format!(
            "missing=0\nfor p in {ports}; do (ss -ltn 2>/dev/null || netstat -ltn 2>/dev/null) | grep -q \":$p \" || missing=1; done\n\
             if [ \"$missing\" = 0 ]; then echo PORTS_LISTENING=1; else echo PORTS_LISTENING=0; fi\n"
        ));
    }

    match &probe.health_url {
        Some(url) => script.push_str(&format!(
            "if curl -fsS -m 5 -o /dev/null {} >/dev/null 2>&1; then echo SELF_HEALTHY=1; else echo SELF_HEALTHY=0; fi\n",
            shell_quote(url)
        )),
        None => script.push_str("echo SELF_HEALTHY=0\n"),
    }

    script
}
