//! Command handlers.
//!
//! Each handler returns the process exit code on success.

use crate::commands::{EventArgs, RunArgs};
use crate::config::CliConfig;
use crate::local::{self, RunOptions, RunOutcome};
use crate::report;
use console::style;
use kiln_core::pipeline::{PipelineSpec, TriggerRule};
use kiln_core::ports::ActionCatalog;
use kiln_core::run::{EXIT_CANCELLED, EXIT_FAILURE, EXIT_SPEC_ERROR, EXIT_SUCCESS};
use kiln_runner::{ActionRegistry, OutputLine, RunnerConfig, ShellRunner, ToolchainCache};
use kiln_scheduler::{GraphError, JobGraph, JobGraphBuilder, OrchestratorConfig, TriggerMatcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type HandlerResult<T = i32> = Result<T, Box<dyn std::error::Error>>;

/// Starter pipeline written by `kiln init`.
pub const STARTER_PIPELINE: &str = r#"name: ci

on:
  pull_request:
  push:
    branches: [main]

jobs:
  check:
    runs-on: local
    steps:
      - uses: actions/checkout@v4
      - uses: dtolnay/rust-toolchain@stable
      - run: cargo check --all-targets

  clippy:
    runs-on: local
    steps:
      - uses: actions/checkout@v4
      - uses: dtolnay/rust-toolchain@stable
        with:
          components: clippy
      - run: cargo clippy --all-targets -- -D warnings

  fmt:
    runs-on: local
    steps:
      - uses: actions/checkout@v4
      - uses: dtolnay/rust-toolchain@stable
        with:
          components: rustfmt
      - run: cargo fmt --all --check
"#;

/// Exit code for an error that escaped a handler.
pub fn error_exit_code(err: &(dyn std::error::Error + 'static)) -> i32 {
    if let Some(err) = err.downcast_ref::<kiln_core::Error>()
        && err.is_fatal()
    {
        return EXIT_SPEC_ERROR;
    }
    if err.downcast_ref::<GraphError>().is_some() {
        return EXIT_SPEC_ERROR;
    }
    EXIT_FAILURE
}

/// Merge config file values with command-line flags. Flags win.
pub fn run_options(config: &CliConfig, args: &RunArgs) -> RunOptions {
    let mut runner = RunnerConfig::default();
    if let Some(minutes) = args.step_timeout.or(config.step_timeout_minutes) {
        runner = runner.with_default_timeout(Duration::from_secs(minutes * 60));
    }
    if let Some(seconds) = config.kill_grace_seconds {
        runner = runner.with_kill_grace(Duration::from_secs(seconds));
    }
    if let Some(shell) = &config.shell {
        runner = runner.with_shell(shell);
    }
    if let Some(root) = &config.workspace_root {
        runner = runner.with_workspace_root(root);
    }
    runner = runner.with_keep_workspaces(args.keep_workspaces || config.keep_workspaces);

    let mut orchestrator = OrchestratorConfig::default();
    if let Some(max_parallel) = args.max_parallel.or(config.max_parallel) {
        orchestrator = orchestrator.with_max_parallel(max_parallel);
    }

    RunOptions {
        runner,
        orchestrator,
        force: args.force,
        source: args.source.clone(),
        variables: args.vars.clone(),
        output: None,
    }
}

/// Run a pipeline locally.
pub async fn run(config: &CliConfig, args: RunArgs) -> HandlerResult {
    let cwd = std::env::current_dir()?;
    let path = local::discover_pipeline(args.file.as_deref(), &cwd)?;
    let spec = PipelineSpec::from_file(&path)?;
    let event = resolve_event(&args.event, &cwd).await?;
    let format = args.format.unwrap_or(config.output_format);

    eprintln!(
        "{} Running {} ({})",
        style("▶").cyan(),
        style(path.display()).bold(),
        style(local::describe_event(&event)).dim()
    );

    let mut options = run_options(config, &args);
    let printer = if args.stream {
        let (tx, rx) = mpsc::channel(256);
        options.output = Some(tx);
        Some(tokio::spawn(print_output(rx)))
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));
    let outcome = local::run_pipeline(&spec, event, options, cancel).await;
    watcher.abort();
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    match outcome? {
        RunOutcome::NotTriggered => {
            eprintln!(
                "{} Event does not match any trigger, nothing to run (use --force to run anyway)",
                style("i").blue()
            );
            Ok(EXIT_SUCCESS)
        }
        RunOutcome::Completed(result) => {
            println!("{}", report::render(&result, format)?);
            Ok(result.exit_code())
        }
    }
}

/// Validate a pipeline declaration.
pub async fn validate(file: Option<PathBuf>) -> HandlerResult {
    let cwd = std::env::current_dir()?;
    let path = local::discover_pipeline(file.as_deref(), &cwd)?;
    let spec = PipelineSpec::from_file(&path)?;
    let graph = build_graph(&spec)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        spec.name.as_deref().unwrap_or("(unnamed)")
    );
    println!("  Triggers: {}", describe_triggers(&spec.triggers));
    println!("  Jobs: {}", graph.len());

    for job in graph.jobs() {
        let needs = if job.needs.is_empty() {
            String::new()
        } else {
            format!(", needs {}", job.needs.join(", "))
        };
        println!("    - {} ({} steps{})", job.name, job.steps.len(), needs);
        for step in &job.steps {
            println!("        {}. {}", step.index + 1, step.name);
        }
    }

    Ok(EXIT_SUCCESS)
}

/// Show whether an event triggers the pipeline and what would run.
pub async fn plan(file: Option<PathBuf>, event_args: EventArgs) -> HandlerResult {
    let cwd = std::env::current_dir()?;
    let path = local::discover_pipeline(file.as_deref(), &cwd)?;
    let spec = PipelineSpec::from_file(&path)?;
    let event = resolve_event(&event_args, &cwd).await?;

    println!("Event: {}", local::describe_event(&event));
    match TriggerMatcher::new().matching_rule(&event, &spec.triggers) {
        Some(rule) => println!(
            "{} Matches trigger: {}",
            style("✓").green(),
            describe_rule(rule)
        ),
        None => {
            println!("{} No trigger matches; the pipeline would not run", style("-").dim());
            return Ok(EXIT_SUCCESS);
        }
    }

    let graph = build_graph(&spec)?;
    println!("Jobs ({}):", graph.len());
    for job in graph.topological_order()? {
        let needs = graph.dependencies(&job.name);
        if needs.is_empty() {
            println!("  {}", job.name);
        } else {
            println!("  {} {}", job.name, style(format!("(after {})", needs.join(", "))).dim());
        }
    }
    Ok(EXIT_SUCCESS)
}

/// Write a starter pipeline.
pub async fn init(path: &Path, force: bool) -> HandlerResult {
    if path.exists() && !force {
        println!(
            "{} {} already exists (use --force to overwrite)",
            style("!").yellow(),
            path.display()
        );
        return Ok(EXIT_SUCCESS);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, STARTER_PIPELINE)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(EXIT_SUCCESS)
}

/// Print the declaration JSON schema.
pub fn schema() -> HandlerResult {
    let schema = PipelineSpec::json_schema();
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(EXIT_SUCCESS)
}

/// Show current configuration.
pub fn show_config(config: &CliConfig) -> HandlerResult {
    let path = CliConfig::config_path()?;
    println!("{}", style(format!("# {}", path.display())).dim());
    print!("{}", serde_yaml::to_string(config)?);
    Ok(EXIT_SUCCESS)
}

/// Set configuration value.
pub fn set_config(key: &str, value: &str) -> HandlerResult {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(EXIT_SUCCESS)
}

/// Validate a declaration against the built-in actions.
pub fn build_graph(spec: &PipelineSpec) -> Result<JobGraph, GraphError> {
    let registry = ActionRegistry::with_builtins(Arc::new(ShellRunner::default()), ToolchainCache::new());
    let catalog: Arc<dyn ActionCatalog> = Arc::new(registry);
    JobGraphBuilder::new().with_catalog(catalog).build(spec)
}

async fn resolve_event(args: &EventArgs, cwd: &Path) -> kiln_core::Result<kiln_core::event::TriggerEvent> {
    let detected = if args.branch.is_none() {
        local::detect_branch(cwd).await
    } else {
        None
    };
    local::build_event(args, detected)
}

fn describe_rule(rule: &TriggerRule) -> String {
    let mut text = rule.event.to_string();
    if let Some(branches) = &rule.branches {
        text.push_str(&format!(" [{}]", branches.join(", ")));
    }
    if !rule.branches_ignore.is_empty() {
        text.push_str(&format!(" ignoring [{}]", rule.branches_ignore.join(", ")));
    }
    text
}

fn describe_triggers(rules: &[TriggerRule]) -> String {
    if rules.is_empty() {
        return "none (only runs with --force)".to_string();
    }
    rules.iter().map(describe_rule).collect::<Vec<_>>().join(", ")
}

async fn print_output(mut rx: mpsc::Receiver<OutputLine>) {
    while let Some(line) = rx.recv().await {
        eprintln!(
            "{} {}",
            style(format!("[{}:{}]", line.job, line.step + 1)).dim(),
            line.content
        );
    }
}

/// First Ctrl-C cancels the run; a second one exits immediately.
async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    eprintln!("{} Cancelling run, press Ctrl-C again to exit", style("!").yellow());
    cancel.cancel();
    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(EXIT_CANCELLED);
    }
}
