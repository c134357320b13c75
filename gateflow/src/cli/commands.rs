//! CLI command definitions and handlers.

use crate::cache::FsCacheStore;
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::context::{EventKind, RunContext, SecretSet};
use crate::errors::GateflowError;
use crate::events::LoggingEventSink;
use crate::observability::LogFormat;
use crate::pipeline::{ExecutionPlan, PipelineEngine, StageGraph};
use crate::runner::ProcessToolRunner;
use crate::sink::FsArtifactSink;
use crate::summary::RunSummary;
use crate::trigger::{Enablement, TriggerEvaluator, DEFAULT_PRIMARY_BRANCH};
use crate::utils::expand_home;
use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Process exit code for an invalid pipeline definition.
pub const EXIT_CONFIGURATION: i32 = 2;

/// Gateflow command-line interface.
#[derive(Parser, Debug)]
#[command(name = "gateflow")]
#[command(about = "Cached, trigger-aware build and verification pipeline for smart contracts")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (`RUST_LOG` takes precedence).
    #[arg(long, env = "GATEFLOW_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log line format.
    #[arg(long, env = "GATEFLOW_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,
}

/// Available subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Execute the pipeline for one event.
    Run(RunArgs),
    /// Show the batches an event would schedule without running anything.
    Plan(PlanArgs),
    /// Delete published artifacts whose retention period has passed.
    Sweep(SweepArgs),
}

/// Which pipeline, checkout and event a command applies to.
#[derive(clap::Args, Debug, Clone)]
pub struct TargetArgs {
    /// Checkout directory.
    #[arg(short = 'C', long, env = "GATEFLOW_WORKDIR", default_value = ".")]
    pub workdir: PathBuf,

    /// Pipeline definition (YAML). Defaults to the built-in contract pipeline.
    #[arg(short, long, env = "GATEFLOW_PIPELINE")]
    pub pipeline: Option<PathBuf>,

    /// Triggering event: `push` or `pull_request`.
    #[arg(long, env = "GATEFLOW_EVENT", default_value = "push")]
    pub event: EventKind,

    /// Pushed branch, or the target branch of a pull request.
    #[arg(short, long, env = "GATEFLOW_BRANCH")]
    pub branch: String,

    /// Commit id.
    #[arg(long, env = "GATEFLOW_COMMIT", default_value = "HEAD")]
    pub commit: String,

    /// Overrides the pipeline's primary branch.
    #[arg(long, env = "GATEFLOW_PRIMARY_BRANCH")]
    pub primary_branch: Option<String>,
}

impl TargetArgs {
    /// Loads and validates the pipeline, resolving the primary branch.
    pub fn load(&self) -> Result<(StageGraph, TriggerEvaluator), GateflowError> {
        let config = match &self.pipeline {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::builtin()?,
        };
        let primary = self
            .primary_branch
            .clone()
            .or_else(|| config.primary_branch.clone())
            .unwrap_or_else(|| DEFAULT_PRIMARY_BRANCH.to_string());
        let graph = config.into_graph()?;
        Ok((graph, TriggerEvaluator::new(primary)))
    }

    fn context(&self, secrets: SecretSet) -> RunContext {
        RunContext::new(self.event, &self.branch, &self.commit).with_secrets(secrets)
    }
}

/// Arguments for `gateflow run`.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Pipeline, checkout and event.
    #[command(flatten)]
    pub target: TargetArgs,

    /// Cache root.
    #[arg(long, env = "GATEFLOW_CACHE_DIR", default_value = "~/.cache/gateflow")]
    pub cache_dir: String,

    /// Directory artifacts are published to.
    #[arg(long, env = "GATEFLOW_ARTIFACT_DIR", default_value = "artifacts")]
    pub artifact_dir: String,

    /// Environment variables to inject as secrets (repeatable or comma separated).
    #[arg(long = "secret", env = "GATEFLOW_SECRETS", value_delimiter = ',')]
    pub secrets: Vec<String>,

    /// Also write the run summary as JSON to this path.
    #[arg(long, env = "GATEFLOW_SUMMARY_JSON")]
    pub summary_json: Option<PathBuf>,
}

/// Arguments for `gateflow plan`.
#[derive(clap::Args, Debug, Clone)]
pub struct PlanArgs {
    /// Pipeline, checkout and event.
    #[command(flatten)]
    pub target: TargetArgs,

    /// Print the plan as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `gateflow sweep`.
#[derive(clap::Args, Debug, Clone)]
pub struct SweepArgs {
    /// Directory artifacts are published to.
    #[arg(long, env = "GATEFLOW_ARTIFACT_DIR", default_value = "artifacts")]
    pub artifact_dir: String,

    /// Directory relative artifact paths resolve against.
    #[arg(short = 'C', long, env = "GATEFLOW_WORKDIR", default_value = ".")]
    pub workdir: PathBuf,
}

/// Parses the process arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command and returns the process exit code.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run(args) => run_pipeline(args).await,
        Commands::Plan(args) => show_plan(&args),
        Commands::Sweep(args) => sweep(&args),
    }
}

fn configuration_failure(err: &GateflowError) -> i32 {
    error!(error = %err, "Invalid pipeline definition");
    eprintln!("error: {err}");
    EXIT_CONFIGURATION
}

async fn run_pipeline(args: RunArgs) -> anyhow::Result<i32> {
    let (graph, evaluator) = match args.target.load() {
        Ok(loaded) => loaded,
        Err(e) => return Ok(configuration_failure(&e)),
    };

    let workdir = args
        .target
        .workdir
        .canonicalize()
        .with_context(|| format!("workdir {} is not accessible", args.target.workdir.display()))?;
    let cache = FsCacheStore::open(expand_home(&args.cache_dir, &workdir))?;
    let sink = FsArtifactSink::new(expand_home(&args.artifact_dir, &workdir));

    let secrets = SecretSet::from_env(&args.secrets);
    for name in args.secrets.iter().filter(|n| secrets.get(n).is_none()) {
        warn!(secret = %name, "Secret not set in environment");
    }
    let ctx = args.target.context(secrets);

    let engine = PipelineEngine::new(
        graph,
        Arc::new(ProcessToolRunner::new()),
        Arc::new(cache),
        Arc::new(sink),
        &workdir,
    )
    .with_events(Arc::new(LoggingEventSink::debug()))
    .with_evaluator(evaluator);

    let cancel = Arc::new(CancellationToken::new());
    let interrupt = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel("interrupted");
            }
        })
    };
    let result = engine.run(&ctx, cancel).await;
    interrupt.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) if e.is_configuration() => return Ok(configuration_failure(&e)),
        Err(e) => return Err(e.into()),
    };

    let summary = RunSummary::from_report(&report);
    println!("{}", summary.render_text());
    if let Some(path) = &args.summary_json {
        std::fs::write(path, summary.to_json()?)
            .with_context(|| format!("cannot write summary to {}", path.display()))?;
        info!(path = %path.display(), "Wrote run summary");
    }
    Ok(report.exit_code())
}

fn show_plan(args: &PlanArgs) -> anyhow::Result<i32> {
    let (graph, evaluator) = match args.target.load() {
        Ok(loaded) => loaded,
        Err(e) => return Ok(configuration_failure(&e)),
    };
    let ctx = args.target.context(SecretSet::new());
    let enablement = evaluator.evaluate(&graph, &ctx);
    let plan = match graph.plan(&enablement.enabled) {
        Ok(plan) => plan,
        Err(e) => return Ok(configuration_failure(&GateflowError::from(e))),
    };

    if args.json {
        let value = serde_json::json!({
            "pipeline": graph.name(),
            "enablement": enablement,
            "plan": plan,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", render_plan(&graph, &ctx, &enablement, &plan));
    }
    Ok(0)
}

fn sweep(args: &SweepArgs) -> anyhow::Result<i32> {
    let sink = FsArtifactSink::new(expand_home(&args.artifact_dir, &args.workdir));
    let removed = sink.sweep_expired(Utc::now())?;
    for path in &removed {
        println!("removed {}", path.display());
    }
    Ok(0)
}

/// Human-readable plan preview.
pub fn render_plan(
    graph: &StageGraph,
    ctx: &RunContext,
    enablement: &Enablement,
    plan: &ExecutionPlan,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "pipeline: {} ({} on '{}')",
        graph.name(),
        ctx.event,
        ctx.branch
    );
    if !enablement.triggered {
        out.push_str("not triggered: every stage would be skipped\n");
        return out;
    }
    for (index, batch) in plan.batches.iter().enumerate() {
        let _ = writeln!(out, "batch {}: {}", index + 1, batch.join(", "));
    }
    for disabled in &plan.disabled {
        let _ = writeln!(out, "disabled: {} ({})", disabled.stage, disabled.reason);
    }
    for (artifact, gate) in &enablement.publish {
        let verdict = if *gate { "publish" } else { "hold" };
        let _ = writeln!(out, "artifact: {artifact} -> {verdict}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("gateflow").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_run_arguments() {
        let cli = parse(&[
            "run",
            "--branch",
            "main",
            "--event",
            "pr",
            "--secret",
            "REGISTRY_TOKEN,SOROBAN_RPC_KEY",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.log_format, LogFormat::Json);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.target.event, EventKind::PullRequest);
        assert_eq!(args.secrets, vec!["REGISTRY_TOKEN", "SOROBAN_RPC_KEY"]);
        assert!(args.target.pipeline.is_none());
    }

    #[test]
    fn test_branch_is_required() {
        assert!(Cli::try_parse_from(["gateflow", "plan"]).is_err());
    }

    #[test]
    fn test_plan_preview_for_pull_request() {
        let cli = parse(&["plan", "--branch", "main", "--event", "pull_request"]);
        let Commands::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        let (graph, evaluator) = args.target.load().unwrap();
        let ctx = args.target.context(SecretSet::new());
        let enablement = evaluator.evaluate(&graph, &ctx);
        let plan = graph.plan(&enablement.enabled).unwrap();

        let text = render_plan(&graph, &ctx, &enablement, &plan);
        assert!(text.starts_with("pipeline: contract (pull_request on 'main')"));
        assert!(text.contains("disabled: optimize"));
        assert!(text.contains("artifact: contract-wasm -> hold"));
    }

    #[test]
    fn test_plan_preview_when_not_triggered() {
        let cli = parse(&["plan", "--branch", "feature/fees"]);
        let Commands::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        let (graph, evaluator) = args.target.load().unwrap();
        let ctx = args.target.context(SecretSet::new());
        let enablement = evaluator.evaluate(&graph, &ctx);
        let plan = graph.plan(&enablement.enabled).unwrap();
        assert!(render_plan(&graph, &ctx, &enablement, &plan).contains("not triggered"));
    }

    #[tokio::test]
    async fn test_invalid_definition_exits_with_configuration_code() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(
            &path,
            "name: broken\nstages:\n  - id: a\n    depends_on: [b]\n    commands: [{program: cargo}]\n  - id: b\n    depends_on: [a]\n    commands: [{program: cargo}]\n",
        )
        .unwrap();
        let workdir = dir.path().display().to_string();
        let pipeline = path.display().to_string();
        let cli = parse(&["run", "-C", &workdir, "-p", &pipeline, "-b", "main"]);

        assert_eq!(run_with_cli(cli).await.unwrap(), EXIT_CONFIGURATION);
    }

    #[tokio::test]
    async fn test_sweep_on_missing_directory_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().display().to_string();
        let cli = parse(&["sweep", "-C", &workdir, "--artifact-dir", "never-published"]);

        assert_eq!(run_with_cli(cli).await.unwrap(), 0);
    }

    #[test]
    fn test_primary_branch_override() {
        let cli = parse(&["plan", "--branch", "trunk", "--primary-branch", "trunk"]);
        let Commands::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        let (_, evaluator) = args.target.load().unwrap();
        assert_eq!(evaluator.primary_branch(), "trunk");
    }
}
