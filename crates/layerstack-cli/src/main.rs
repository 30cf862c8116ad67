//! layerstack - dependency-ordered infrastructure layer deployment
//!
//! ## Commands
//!
//! - `deploy`: Verify and deploy layers in dependency order, rolling back on failure
//! - `verify`: Report which layers would deploy without changing anything
//! - `destroy`: Tear layers down in reverse dependency order
//! - `status`: Show the recorded deployment state
//! - `list`: Show the layer graph in execution order

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use layerstack_core::{
    ConfigGraph, DestroyReport, LayerPhase, LayerRegistry, Orchestrator, RunOptions, RunReport,
    StackConfig,
};
use layerstack_state::{FileStateStore, StateStore};
use serde::Serialize;
use tracing::{debug, Level};

#[derive(Parser, Debug)]
#[command(name = "layerstack")]
#[command(author = "Stevedores Org")]
#[command(version = layerstack_core::VERSION)]
#[command(about = "Dependency-ordered infrastructure layer deployment", long_about = None)]
struct Cli {
    /// Stack configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "LAYERSTACK_CONFIG",
        default_value = "layerstack.yaml"
    )]
    config: PathBuf,

    /// Log verbosity
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Emit JSON log lines and JSON reports
    #[arg(long, global = true)]
    json: bool,

    /// Verify only; never deploy, destroy or write state
    #[arg(long, global = true)]
    dry_run: bool,

    /// Keep going after a layer fails instead of rolling back
    #[arg(long, global = true)]
    continue_on_error: bool,

    /// Deploy every selected layer without verifying first
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy layers (all enabled layers when none are named)
    Deploy {
        /// Target layers; prerequisites are included automatically
        layers: Vec<String>,
    },

    /// Show which layers would deploy
    Verify {
        /// Target layers; prerequisites are included automatically
        layers: Vec<String>,
    },

    /// Destroy layers in reverse dependency order
    Destroy {
        /// Layers to destroy (all enabled layers when omitted)
        layers: Vec<String>,
    },

    /// Show recorded layer outputs
    Status,

    /// List layers in execution order
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl Cli {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            continue_on_error: self.continue_on_error,
            dry_run: self.dry_run,
            force: self.force,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    layerstack_core::init_tracing(cli.json, cli.log_level.into());

    match dispatch(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the selected command. `Ok(false)` means the command ran but the
/// deployment did not succeed.
async fn dispatch(cli: Cli) -> Result<bool> {
    let config = load_config(&cli.config)?;
    let options = cli.run_options();
    debug!(config = %cli.config.display(), ?options, "loaded configuration");

    match cli.command {
        Commands::Deploy { layers } => cmd_deploy(&config, options, &layers, cli.json).await,
        Commands::Verify { layers } => cmd_verify(&config, options, &layers, cli.json).await,
        Commands::Destroy { layers } => cmd_destroy(&config, options, &layers, cli.json).await,
        Commands::Status => cmd_status(&config, cli.json).await,
        Commands::List => cmd_list(&config, cli.json),
    }
}

fn load_config(path: &Path) -> Result<StackConfig> {
    StackConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

async fn cmd_deploy(
    config: &StackConfig,
    options: RunOptions,
    layers: &[String],
    json: bool,
) -> Result<bool> {
    let mut orch = Orchestrator::from_config(config, options)
        .await
        .context("Failed to initialize orchestrator")?;
    let report = orch.run(layers).await?;
    print_run_report(&report, options.dry_run, json)?;
    Ok(report.success)
}

async fn cmd_verify(
    config: &StackConfig,
    options: RunOptions,
    layers: &[String],
    json: bool,
) -> Result<bool> {
    let mut orch = Orchestrator::from_config(config, options)
        .await
        .context("Failed to initialize orchestrator")?;
    let report = orch.verify(layers).await?;
    print_run_report(&report, true, json)?;
    Ok(report.success)
}

async fn cmd_destroy(
    config: &StackConfig,
    options: RunOptions,
    layers: &[String],
    json: bool,
) -> Result<bool> {
    let mut orch = Orchestrator::from_config(config, options)
        .await
        .context("Failed to initialize orchestrator")?;
    let report = orch.destroy(layers).await?;
    print_destroy_report(&report, options.dry_run, json)?;
    Ok(report.success)
}

async fn cmd_status(config: &StackConfig, json: bool) -> Result<bool> {
    let store = FileStateStore::new(config.state_file());
    let state = store
        .load()
        .await
        .with_context(|| format!("Failed to read state from {}", store.location()))?;

    let Some(state) = state else {
        if json {
            println!("null");
        } else {
            println!("No deployment state at {}", store.location());
        }
        return Ok(true);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(true);
    }

    println!("State: {} (updated {})", store.location(), state.timestamp);
    for (name, output) in &state.layers {
        let marker = if output.deployed { "deployed" } else { "existing" };
        println!("  {name} [{marker}]");
        for (key, value) in &output.outputs {
            println!("    {key} = {value}");
        }
    }
    Ok(true)
}

#[derive(Debug, Serialize)]
struct LayerListing {
    name: String,
    kind: String,
    enabled: bool,
    depends_on: Vec<String>,
}

fn layer_listing(config: &StackConfig) -> Result<Vec<LayerListing>> {
    let registry = LayerRegistry::with_builtin();
    let defs = ConfigGraph::validate(&config.raw, |kind| registry.requires_source(kind))?;
    let graph = ConfigGraph::new(defs)?;

    let mut listing = Vec::new();
    for name in graph.execution_order()? {
        if let Some(def) = graph.definition(&name) {
            listing.push(LayerListing {
                name: def.name.clone(),
                kind: def.deployment.kind.clone(),
                enabled: def.enabled,
                depends_on: def.depends_on.clone(),
            });
        }
    }
    for def in graph.layers().iter().filter(|d| !d.enabled) {
        listing.push(LayerListing {
            name: def.name.clone(),
            kind: def.deployment.kind.clone(),
            enabled: false,
            depends_on: def.depends_on.clone(),
        });
    }
    Ok(listing)
}

fn cmd_list(config: &StackConfig, json: bool) -> Result<bool> {
    let listing = layer_listing(config)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(true);
    }
    for (i, layer) in listing.iter().enumerate() {
        let deps = if layer.depends_on.is_empty() {
            "-".to_string()
        } else {
            layer.depends_on.join(", ")
        };
        let status = if layer.enabled { "" } else { " (disabled)" };
        println!(
            "{:>3}. {} [{}]{} <- {}",
            i + 1,
            layer.name,
            layer.kind,
            status,
            deps
        );
    }
    Ok(true)
}

fn print_run_report(report: &RunReport, dry_run: bool, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Run {}", report.run_id);
    for layer in &report.layers {
        let verdict = if dry_run && layer.would_deploy {
            "would deploy".to_string()
        } else if dry_run && layer.phase == LayerPhase::Skipped {
            "up to date".to_string()
        } else {
            layer.phase.to_string()
        };
        let mut line = format!("  {:<24} {verdict}", layer.layer);
        if let Some(ms) = layer.duration_ms {
            line.push_str(&format!(" ({ms}ms)"));
        }
        if let Some(reason) = layer.reason.as_deref().filter(|_| layer.error.is_none()) {
            line.push_str(&format!(" - {reason}"));
        }
        println!("{line}");
        if let Some(err) = &layer.error {
            println!("      {err}");
        }
    }

    if !report.rollback.is_empty() {
        println!("Rollback:");
        for outcome in &report.rollback {
            match &outcome.error {
                None => println!("  {:<24} destroyed", outcome.layer),
                Some(err) => println!("  {:<24} FAILED: {err}", outcome.layer),
            }
        }
    }

    match &report.error {
        None => println!("OK"),
        Some(err) => println!("FAILED: {err}"),
    }
    Ok(())
}

fn print_destroy_report(report: &DestroyReport, dry_run: bool, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if dry_run {
        println!("Would destroy, in order:");
        for layer in &report.order {
            println!("  {layer}");
        }
        return Ok(());
    }

    println!("Destroy {}", report.run_id);
    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!("  {:<24} destroyed", outcome.layer),
            Some(err) => println!("  {:<24} FAILED: {err}", outcome.layer),
        }
    }
    if report.state_cleared {
        println!("State cleared");
    }
    println!("{}", if report.success { "OK" } else { "FAILED" });
    Ok(())
}
