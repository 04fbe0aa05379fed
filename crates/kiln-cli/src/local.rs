//! Local pipeline execution: discovery, trigger evaluation and the run itself.

use crate::commands::EventArgs;
use kiln_core::event::TriggerEvent;
use kiln_core::pipeline::PipelineSpec;
use kiln_core::ports::{ActionCatalog, RunContext};
use kiln_core::run::PipelineResult;
use kiln_core::{Error, Result};
use kiln_runner::{JobExecutor, OutputLine, RunnerConfig};
use kiln_scheduler::{JobGraphBuilder, Orchestrator, OrchestratorConfig, TriggerMatcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where pipelines are looked for, in order.
pub const PIPELINE_CANDIDATES: &[&str] = &[
    ".kiln/pipeline.yaml",
    ".kiln/pipeline.yml",
    "kiln.yaml",
    "kiln.yml",
    ".github/workflows/ci.yml",
];

/// Branch assumed when none is given and none can be detected.
const FALLBACK_BRANCH: &str = "main";

/// Resolve the pipeline file: the explicit path, else the first candidate
/// present in `dir`.
pub fn discover_pipeline(explicit: Option<&Path>, dir: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    PIPELINE_CANDIDATES
        .iter()
        .map(|candidate| dir.join(candidate))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            Error::spec(format!(
                "no pipeline found in {} (looked for {})",
                dir.display(),
                PIPELINE_CANDIDATES.join(", ")
            ))
        })
}

/// Build the event from command-line arguments. `detected_branch` fills in
/// for a missing `--branch`.
pub fn build_event(args: &EventArgs, detected_branch: Option<String>) -> Result<TriggerEvent> {
    let branch = args.branch.clone().or(detected_branch).or_else(|| {
        (args.base.is_none() || args.event == "push").then(|| {
            warn!(branch = FALLBACK_BRANCH, "No branch given or detected, assuming default");
            FALLBACK_BRANCH.to_string()
        })
    });
    let event = TriggerEvent::parse(&args.event, branch.as_deref(), args.base.as_deref())?;
    Ok(match &args.sha {
        Some(sha) => event.with_sha(sha),
        None => event,
    })
}

/// Current branch of the git repository at `dir`, if any.
pub async fn detect_branch(dir: &Path) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .stderr(std::process::Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(branch = %branch, "Detected git branch");
    // Detached checkouts report `HEAD`.
    (!branch.is_empty() && branch != "HEAD").then_some(branch)
}

/// One-line description of an event for status messages.
pub fn describe_event(event: &TriggerEvent) -> String {
    match event {
        TriggerEvent::Push { branch, .. } => format!("push to {}", branch),
        TriggerEvent::PullRequest {
            base_branch,
            head_branch,
            ..
        } => format!("pull_request {} <- {}", base_branch, head_branch),
        TriggerEvent::Other { name } => name.clone(),
    }
}

/// Everything a local run needs besides the declaration and the event.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub runner: RunnerConfig,
    pub orchestrator: OrchestratorConfig,
    /// Skip trigger evaluation.
    pub force: bool,
    /// Repository for `actions/checkout`.
    pub source: Option<PathBuf>,
    pub variables: Vec<(String, String)>,
    pub output: Option<mpsc::Sender<OutputLine>>,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// No trigger matched; nothing was built or run.
    NotTriggered,
    Completed(PipelineResult),
}

/// Match triggers, build the job graph and run it.
///
/// Declaration errors surface as `Err` before any job starts. Everything
/// that happens once jobs run is reported inside the result.
pub async fn run_pipeline(
    spec: &PipelineSpec,
    event: TriggerEvent,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    if !options.force && !TriggerMatcher::new().matches(&event, &spec.triggers) {
        info!(event = event.kind_name(), branch = ?event.filter_branch(), "No trigger matches event");
        return Ok(RunOutcome::NotTriggered);
    }

    let mut executor = JobExecutor::new(options.runner);
    if let Some(tx) = options.output {
        executor = executor.with_output(tx);
    }
    let catalog: Arc<dyn ActionCatalog> = executor.actions();
    let graph = JobGraphBuilder::new().with_catalog(catalog).build(spec)?;

    let mut ctx = RunContext::new(event);
    if let Some(source) = options.source {
        ctx = ctx.with_source(source);
    }
    for (key, value) in options.variables {
        ctx = ctx.with_variable(key, value);
    }

    let orchestrator = Orchestrator::new(Arc::new(executor), options.orchestrator);
    let result = orchestrator
        .execute(&graph, ctx, cancel)
        .await
        .with_pipeline_name(spec.name.clone());
    Ok(RunOutcome::Completed(result))
}
