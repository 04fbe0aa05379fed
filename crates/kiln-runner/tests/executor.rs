//! Job executor tests against the host shell.

use async_trait::async_trait;
use indexmap::IndexMap;
use kiln_core::event::TriggerEvent;
use kiln_core::job::{ExecutableJob, ExecutableStep, StepKind};
use kiln_core::pipeline::ActionRef;
use kiln_core::ports::{JobRunner, RunContext};
use kiln_core::run::{FailureKind, JobStatus, StepStatus};
use kiln_core::{Error, Result};
use kiln_runner::{
    ActionCall, ActionHandler, ActionOutcome, ActionRegistry, EnvironmentProvider, JobEnvironment,
    JobExecutor, ProcessOutcome, RunnerConfig,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn command(index: usize, run: &str) -> ExecutableStep {
    ExecutableStep {
        index,
        name: run.to_string(),
        env: IndexMap::new(),
        timeout: None,
        kind: StepKind::Command {
            run: run.to_string(),
            shell: None,
        },
    }
}

fn action(index: usize, uses: &str) -> ExecutableStep {
    ExecutableStep {
        index,
        name: uses.to_string(),
        env: IndexMap::new(),
        timeout: None,
        kind: StepKind::Action {
            action: ActionRef::parse(uses).unwrap(),
            with: IndexMap::new(),
        },
    }
}

fn job(name: &str, steps: Vec<ExecutableStep>) -> ExecutableJob {
    ExecutableJob {
        index: 0,
        name: name.to_string(),
        runner_label: "local".into(),
        needs: Vec::new(),
        env: IndexMap::new(),
        timeout: None,
        steps,
    }
}

fn executor(root: &TempDir) -> JobExecutor {
    JobExecutor::new(
        RunnerConfig::default()
            .with_workspace_root(root.path())
            .with_kill_grace(Duration::from_millis(200)),
    )
}

fn ctx() -> RunContext {
    RunContext::new(TriggerEvent::push("main"))
}

#[tokio::test]
async fn test_all_steps_succeed() {
    let root = tempfile::tempdir().unwrap();
    let job = job("check", vec![command(0, "echo building"), command(1, "echo testing")]);

    let result = executor(&root).run(&job, &ctx(), CancellationToken::new()).await;

    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(result.failure, None);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[0].output, "building\n");
    assert_eq!(result.steps[1].output, "testing\n");
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Success));
    assert!(result.started_at.is_some() && result.ended_at.is_some());
}

#[tokio::test]
async fn test_fail_fast_skips_remaining_steps() {
    let root = tempfile::tempdir().unwrap();
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("ran");
    let job = job(
        "fmt",
        vec![
            command(0, "echo first"),
            command(1, "echo bad formatting >&2; exit 4"),
            command(2, &format!("touch '{}'", marker.display())),
        ],
    );

    let result = executor(&root).run(&job, &ctx(), CancellationToken::new()).await;

    assert_eq!(result.status, JobStatus::Failure);
    assert_eq!(result.failure, Some(FailureKind::StepFailure));
    let statuses: Vec<StepStatus> = result.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Success, StepStatus::Failure, StepStatus::Skipped]
    );
    assert_eq!(result.steps[1].exit_code, Some(4));
    assert_eq!(result.steps[1].output, "bad formatting\n");
    assert_eq!(result.steps[2].started_at, None);
    assert!(!marker.exists());
    assert!(result.error.unwrap().contains("exited with code 4"));
}

#[tokio::test]
async fn test_steps_share_the_workspace() {
    let root = tempfile::tempdir().unwrap();
    let job = job(
        "check",
        vec![command(0, "echo hello > greeting.txt"), command(1, "cat greeting.txt")],
    );

    let result = executor(&root).run(&job, &ctx(), CancellationToken::new()).await;

    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(result.steps[1].output, "hello\n");
}

#[tokio::test]
async fn test_workspace_is_removed_after_job() {
    let root = tempfile::tempdir().unwrap();
    let job = job("check", vec![command(0, "pwd; test -d \"$KILN_STEP_TEMP\"")]);

    let result = executor(&root).run(&job, &ctx(), CancellationToken::new()).await;

    assert_eq!(result.status, JobStatus::Success);
    let workspace = result.steps[0].output.trim().to_string();
    assert!(!workspace.is_empty());
    assert!(!std::path::Path::new(&workspace).exists());
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_step_environment() {
    let root = tempfile::tempdir().unwrap();
    let mut job = job(
        "clippy",
        vec![command(0, "echo \"$CI $KILN_JOB $KILN_EVENT $KILN_BRANCH $LEVEL ${{ env.LEVEL }}\"")],
    );
    job.env.insert("LEVEL".into(), "deny".into());
    let ctx = RunContext::new(TriggerEvent::push("feature/x"));

    let result = executor(&root).run(&job, &ctx, CancellationToken::new()).await;

    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(result.steps[0].output, "true clippy push feature/x deny deny\n");
}

#[tokio::test]
async fn test_step_timeout() {
    let root = tempfile::tempdir().unwrap();
    let mut slow = command(0, "sleep 30");
    slow.timeout = Some(Duration::from_millis(300));
    let job = job("check", vec![slow, command(1, "echo unreachable")]);

    let start = Instant::now();
    let result = executor(&root).run(&job, &ctx(), CancellationToken::new()).await;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(result.status, JobStatus::Failure);
    assert!(result.is_timeout());
    assert_eq!(result.steps[0].failure, Some(FailureKind::Timeout));
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_job_timeout_applies_to_steps() {
    let root = tempfile::tempdir().unwrap();
    let mut job = job("check", vec![command(0, "sleep 30")]);
    job.timeout = Some(Duration::from_millis(300));

    let result = executor(&root).run(&job, &ctx(), CancellationToken::new()).await;

    assert!(result.is_timeout());
}

#[tokio::test]
async fn test_job_timeout_bounds_all_steps_together() {
    let root = tempfile::tempdir().unwrap();
    let mut job = job(
        "check",
        vec![command(0, "sleep 0.6"), command(1, "sleep 0.6"), command(2, "echo unreachable")],
    );
    job.timeout = Some(Duration::from_secs(1));

    let start = Instant::now();
    let result = executor(&root).run(&job, &ctx(), CancellationToken::new()).await;

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(result.status, JobStatus::Failure);
    assert!(result.is_timeout());
    assert_eq!(result.steps[0].status, StepStatus::Success);
    assert_eq!(result.steps[1].failure, Some(FailureKind::Timeout));
    assert_eq!(result.steps[2].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_cancellation_stops_running_step() {
    let root = tempfile::tempdir().unwrap();
    let job = job("check", vec![command(0, "sleep 30"), command(1, "echo unreachable")]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let result = executor(&root).run(&job, &ctx(), cancel).await;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.failure, Some(FailureKind::Cancelled));
    assert_eq!(result.steps[0].status, StepStatus::Cancelled);
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let root = tempfile::tempdir().unwrap();
    let job = job("check", vec![command(0, "echo never")]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = executor(&root).run(&job, &ctx(), cancel).await;

    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.started_at, None);
    assert_eq!(result.steps[0].status, StepStatus::Skipped);
}

struct BrokenEnvironment;

#[async_trait]
impl EnvironmentProvider for BrokenEnvironment {
    async fn acquire(&self, _job: &ExecutableJob) -> Result<JobEnvironment> {
        Err(Error::Environment("disk full".into()))
    }
}

#[tokio::test]
async fn test_environment_failure() {
    let root = tempfile::tempdir().unwrap();
    let job = job("check", vec![command(0, "echo a"), command(1, "echo b")]);
    let executor = executor(&root).with_environments(Arc::new(BrokenEnvironment));

    let result = executor.run(&job, &ctx(), CancellationToken::new()).await;

    assert_eq!(result.status, JobStatus::Failure);
    assert_eq!(result.failure, Some(FailureKind::Environment));
    assert!(result.error.unwrap().contains("disk full"));
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Skipped));
}

#[tokio::test]
async fn test_unknown_action_fails_step() {
    let root = tempfile::tempdir().unwrap();
    let job = job("check", vec![action(0, "actions/cache@v4"), command(1, "echo b")]);

    let result = executor(&root).run(&job, &ctx(), CancellationToken::new()).await;

    assert_eq!(result.status, JobStatus::Failure);
    assert_eq!(result.steps[0].failure, Some(FailureKind::StepFailure));
    assert!(result.steps[0].error.as_deref().unwrap().contains("actions/cache@v4"));
    assert_eq!(result.steps[1].status, StepStatus::Skipped);
}

/// Exports `GREETING` to later steps.
struct GreetAction;

#[async_trait]
impl ActionHandler for GreetAction {
    fn name(&self) -> &str {
        "local/greet"
    }

    async fn execute(&self, call: &ActionCall<'_>, _cancel: &CancellationToken) -> Result<ActionOutcome> {
        let who = call.param_str("who").unwrap_or_else(|| "world".into());
        Ok(ActionOutcome::new(ProcessOutcome::exited(0, "greeted\n"))
            .with_export("GREETING", format!("hello {}", who)))
    }
}

#[tokio::test]
async fn test_action_exports_reach_later_steps() {
    let root = tempfile::tempdir().unwrap();
    let executor = executor(&root);
    let mut registry = ActionRegistry::with_builtins(executor.shell(), Default::default());
    registry.register(Arc::new(GreetAction));
    let executor = executor.with_actions(Arc::new(registry));

    let mut greet = action(0, "local/greet@v1");
    if let StepKind::Action { with, .. } = &mut greet.kind {
        with.insert("who".into(), serde_json::json!("${{ job.name }}"));
    }
    let job = job("fmt", vec![greet, command(1, "echo \"$GREETING\"")]);

    let result = executor.run(&job, &ctx(), CancellationToken::new()).await;

    assert_eq!(result.status, JobStatus::Success);
    assert_eq!(result.steps[0].output, "greeted\n");
    assert_eq!(result.steps[1].output, "hello fmt\n");
}

#[tokio::test]
async fn test_output_is_forwarded() {
    let root = tempfile::tempdir().unwrap();
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let executor = executor(&root).with_output(tx);
    let job = job("check", vec![command(0, "echo streamed")]);

    let result = executor.run(&job, &ctx(), CancellationToken::new()).await;
    assert_eq!(result.status, JobStatus::Success);

    let line = rx.recv().await.unwrap();
    assert_eq!(line.job, "check");
    assert_eq!(line.step, 0);
    assert_eq!(line.content, "streamed");
}

fn git(args: &[&str], dir: &std::path::Path) -> bool {
    std::process::Command::new("git")
        .args(["-c", "user.name=kiln", "-c", "user.email=kiln@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_checkout_clones_source() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("README"), "kiln\n").unwrap();
    let ready = git(&["init", "--quiet"], source.path())
        && git(&["add", "README"], source.path())
        && git(&["commit", "--quiet", "-m", "initial"], source.path());
    if !ready {
        eprintln!("git unavailable, skipping checkout test");
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let job = job("check", vec![action(0, "actions/checkout@v4"), command(1, "cat README")]);
    let ctx = ctx().with_source(source.path());

    let result = executor(&root).run(&job, &ctx, CancellationToken::new()).await;

    assert_eq!(result.status, JobStatus::Success, "{:?}", result.steps);
    assert_eq!(result.steps[1].output, "kiln\n");
}
