//! Job executor: runs one job's steps in order inside its environment.

use crate::actions::{ActionCall, ActionOutcome, ActionRegistry};
use crate::cache::ToolchainCache;
use crate::environments::{EnvironmentProvider, HostEnvironmentProvider, JobEnvironment};
use crate::runner::{OutputLine, ProcessExit, RunnerConfig, StepContext};
use crate::shell::ShellRunner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use kiln_core::interpolation::Interpolator;
use kiln_core::job::{ExecutableJob, ExecutableStep, StepKind};
use kiln_core::pipeline::ActionRef;
use kiln_core::ports::{JobRunner, RunContext};
use kiln_core::run::{FailureKind, JobResult, JobStatus, StepResult, StepStatus};
use kiln_core::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Executes jobs on the local host.
pub struct JobExecutor {
    config: RunnerConfig,
    shell: Arc<ShellRunner>,
    actions: Arc<ActionRegistry>,
    environments: Arc<dyn EnvironmentProvider>,
    output: Option<mpsc::Sender<OutputLine>>,
}

impl JobExecutor {
    /// Executor with the built-in actions and host workspaces.
    pub fn new(config: RunnerConfig) -> Self {
        let shell = Arc::new(ShellRunner::new(config.clone()));
        let actions = Arc::new(ActionRegistry::with_builtins(
            Arc::clone(&shell),
            ToolchainCache::new(),
        ));
        let root = config
            .workspace_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let environments = Arc::new(
            HostEnvironmentProvider::new(root).with_keep_workspaces(config.keep_workspaces),
        );
        Self {
            config,
            shell,
            actions,
            environments,
            output: None,
        }
    }

    pub fn with_actions(mut self, actions: Arc<ActionRegistry>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_environments(mut self, environments: Arc<dyn EnvironmentProvider>) -> Self {
        self.environments = environments;
        self
    }

    /// Forward every output line to `tx` as it is produced.
    pub fn with_output(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.output = Some(tx);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn shell(&self) -> Arc<ShellRunner> {
        Arc::clone(&self.shell)
    }

    /// Registry used to resolve `uses:` steps. Also the catalog to validate
    /// declarations against.
    pub fn actions(&self) -> Arc<ActionRegistry> {
        Arc::clone(&self.actions)
    }

    async fn run_steps(
        &self,
        job: &ExecutableJob,
        environment: &JobEnvironment,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> (Vec<StepResult>, Option<StepStop>) {
        let mut exports: IndexMap<String, String> = IndexMap::new();
        let mut results = Vec::with_capacity(job.steps.len());
        let mut stop: Option<StepStop> = None;
        let job_deadline = job.timeout.map(|limit| Instant::now() + limit);

        for step in &job.steps {
            if stop.is_some() {
                results.push(StepResult::skipped(step.index, &step.name));
                continue;
            }
            if cancel.is_cancelled() {
                info!(job = %job.name, step = step.index, "Run cancelled, skipping remaining steps");
                stop = Some(StepStop::cancelled());
                results.push(StepResult::skipped(step.index, &step.name));
                continue;
            }
            if let (Some(deadline), Some(limit)) = (job_deadline, job.timeout)
                && Instant::now() >= deadline
            {
                warn!(job = %job.name, step = step.index, "Job time limit reached, skipping remaining steps");
                stop = Some(StepStop {
                    status: JobStatus::Failure,
                    failure: FailureKind::Timeout,
                    error: Some(format!("job timed out after {:?}", limit)),
                });
                results.push(StepResult::skipped(step.index, &step.name));
                continue;
            }

            let (result, step_exports) = self
                .run_step(job, step, environment, ctx, &exports, job_deadline, cancel)
                .await;

            match result.status {
                StepStatus::Success => exports.extend(step_exports),
                StepStatus::Cancelled => stop = Some(StepStop::cancelled()),
                _ => {
                    stop = Some(StepStop {
                        status: JobStatus::Failure,
                        failure: result.failure.unwrap_or(FailureKind::StepFailure),
                        error: Some(format!(
                            "step `{}` {}",
                            step.name,
                            result.error.as_deref().unwrap_or("failed")
                        )),
                    })
                }
            }
            results.push(result);
        }

        (results, stop)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        job: &ExecutableJob,
        step: &ExecutableStep,
        environment: &JobEnvironment,
        ctx: &RunContext,
        exports: &IndexMap<String, String>,
        job_deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> (StepResult, IndexMap<String, String>) {
        let started_at = Utc::now();

        let scope = match environment.enter_step(step.index) {
            Ok(scope) => scope,
            Err(e) => {
                warn!(job = %job.name, step = step.index, error = %e, "Step scope setup failed");
                let result = StepRecord::new(step, started_at)
                    .failed(FailureKind::Environment, e.to_string());
                return (result, IndexMap::new());
            }
        };

        let mut timeout = step.effective_timeout(job, self.config.default_timeout);
        if let Some(deadline) = job_deadline {
            timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        }
        let env = step_env(job, step, environment.workspace(), scope.path(), ctx, exports);
        let step_ctx = StepContext::new(&job.name, step.index, environment.workspace(), timeout)
            .with_scratch_dir(scope.path())
            .with_env(env)
            .with_output(self.output.clone());

        info!(job = %job.name, step = step.index, name = %step.name, "Running step");

        let interpolator = Interpolator::new(&step_ctx.env, &ctx.event, &job.name, ctx.run_id);
        let outcome = match &step.kind {
            StepKind::Command { run, shell } => {
                let script = interpolator.expand(run);
                self.shell
                    .run_script(&script, shell.as_deref(), &step_ctx, cancel)
                    .await
                    .map(ActionOutcome::new)
            }
            StepKind::Action { action, with } => {
                let with: IndexMap<String, serde_json::Value> = with
                    .iter()
                    .map(|(key, value)| (key.clone(), interpolator.expand_value(value)))
                    .collect();
                self.run_action(action, &with, &step_ctx, ctx, cancel).await
            }
        };

        if let Err(e) = scope.release() {
            warn!(job = %job.name, step = step.index, error = %e, "Failed to release step scope");
        }

        let record = StepRecord::new(step, started_at);
        match outcome {
            Ok(outcome) => {
                let result = record.finish(&outcome, timeout);
                debug!(
                    job = %job.name,
                    step = step.index,
                    status = result.status.as_str(),
                    exit_code = ?result.exit_code,
                    "Step finished"
                );
                let exports = if result.status == StepStatus::Success {
                    outcome.exports
                } else {
                    IndexMap::new()
                };
                (result, exports)
            }
            Err(e) => {
                warn!(job = %job.name, step = step.index, error = %e, "Step errored");
                (record.errored(e), IndexMap::new())
            }
        }
    }

    async fn run_action(
        &self,
        action: &ActionRef,
        with: &IndexMap<String, serde_json::Value>,
        step: &StepContext,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> Result<ActionOutcome> {
        let handler = self
            .actions
            .get(action)
            .ok_or_else(|| Error::ActionNotFound(action.to_string()))?;
        let call = ActionCall {
            action,
            with,
            step,
            run: ctx,
        };
        handler.execute(&call, cancel).await
    }
}

#[async_trait]
impl JobRunner for JobExecutor {
    async fn run(&self, job: &ExecutableJob, ctx: &RunContext, cancel: CancellationToken) -> JobResult {
        if cancel.is_cancelled() {
            return job.not_run(JobStatus::Cancelled);
        }

        let started_at = Utc::now();
        let mut status = JobStatus::Pending;
        advance(&mut status, JobStatus::Running, &job.name);
        info!(job = %job.name, run_id = %ctx.run_id, steps = job.steps.len(), "Starting job");

        let environment = match self.environments.acquire(job).await {
            Ok(environment) => environment,
            Err(e) => {
                error!(job = %job.name, error = %e, "Failed to acquire job environment");
                advance(&mut status, JobStatus::Failure, &job.name);
                let mut result = JobResult::not_run(&job.name, status, job.step_names())
                    .with_error(e.to_string());
                result.failure = Some(FailureKind::Environment);
                result.started_at = Some(started_at);
                result.ended_at = Some(Utc::now());
                return result;
            }
        };

        let (steps, stop) = self.run_steps(job, &environment, ctx, &cancel).await;

        if let Err(e) = environment.release().await {
            warn!(job = %job.name, error = %e, "Failed to release job environment");
        }

        let (next, failure, error) = match stop {
            None => (JobStatus::Success, None, None),
            Some(stop) => (stop.status, Some(stop.failure), stop.error),
        };
        advance(&mut status, next, &job.name);

        let result = JobResult {
            name: job.name.clone(),
            status,
            failure,
            error,
            steps,
            started_at: Some(started_at),
            ended_at: Some(Utc::now()),
        };
        info!(
            job = %job.name,
            status = result.status.as_str(),
            duration_ms = result.duration_ms().unwrap_or_default(),
            "Job finished"
        );
        result
    }
}

/// Why a job stopped running steps.
struct StepStop {
    status: JobStatus,
    failure: FailureKind,
    error: Option<String>,
}

impl StepStop {
    fn cancelled() -> Self {
        Self {
            status: JobStatus::Cancelled,
            failure: FailureKind::Cancelled,
            error: None,
        }
    }
}

/// Apply a lifecycle transition. Every caller moves along a legal edge, so a
/// rejected transition is only logged.
fn advance(status: &mut JobStatus, next: JobStatus, job: &str) {
    match status.transition(next) {
        Ok(next) => *status = next,
        Err(e) => warn!(job, error = %e, "Ignoring job status change"),
    }
}

/// Builds a [`StepResult`] once the step ends.
struct StepRecord<'a> {
    step: &'a ExecutableStep,
    started_at: DateTime<Utc>,
}

impl<'a> StepRecord<'a> {
    fn new(step: &'a ExecutableStep, started_at: DateTime<Utc>) -> Self {
        Self { step, started_at }
    }

    fn result(&self, status: StepStatus) -> StepResult {
        StepResult {
            index: self.step.index,
            name: self.step.name.clone(),
            status,
            failure: None,
            exit_code: None,
            output: String::new(),
            output_truncated: false,
            error: None,
            started_at: Some(self.started_at),
            ended_at: Some(Utc::now()),
        }
    }

    fn finish(&self, outcome: &ActionOutcome, timeout: Duration) -> StepResult {
        let process = &outcome.process;
        let mut result = match process.exit {
            ProcessExit::Exited(0) => self.result(StepStatus::Success),
            ProcessExit::Exited(code) => {
                let mut result = self.result(StepStatus::Failure);
                result.failure = Some(FailureKind::StepFailure);
                result.error = Some(format!("exited with code {}", code));
                result
            }
            ProcessExit::TimedOut => {
                let mut result = self.result(StepStatus::Failure);
                result.failure = Some(FailureKind::Timeout);
                result.error = Some(format!("timed out after {:?}", timeout));
                result
            }
            ProcessExit::Cancelled => {
                let mut result = self.result(StepStatus::Cancelled);
                result.failure = Some(FailureKind::Cancelled);
                result
            }
        };
        if let ProcessExit::Exited(code) = process.exit {
            result.exit_code = Some(code);
        }
        result.output = process.output.clone();
        result.output_truncated = process.truncated;
        result
    }

    fn failed(&self, failure: FailureKind, error: String) -> StepResult {
        let mut result = self.result(StepStatus::Failure);
        result.failure = Some(failure);
        result.error = Some(error);
        result
    }

    fn errored(&self, err: Error) -> StepResult {
        match err {
            Error::StepTimeout { .. } => self.failed(FailureKind::Timeout, err.to_string()),
            Error::Environment(_) => self.failed(FailureKind::Environment, err.to_string()),
            Error::Cancelled { .. } => {
                let mut result = self.result(StepStatus::Cancelled);
                result.failure = Some(FailureKind::Cancelled);
                result
            }
            Error::StepFailed { exit_code, .. } => {
                let mut result = self.failed(FailureKind::StepFailure, err.to_string());
                result.exit_code = Some(exit_code);
                result
            }
            other => self.failed(FailureKind::StepFailure, other.to_string()),
        }
    }
}

/// Environment for one step, lowest precedence first: run variables, kiln
/// variables, exports from earlier steps, job env, step env.
fn step_env(
    job: &ExecutableJob,
    step: &ExecutableStep,
    workspace: &Path,
    scratch: &Path,
    ctx: &RunContext,
    exports: &IndexMap<String, String>,
) -> IndexMap<String, String> {
    let mut env = ctx.variables.clone();
    env.insert("CI".into(), "true".into());
    env.insert("KILN".into(), "true".into());
    env.insert("KILN_WORKSPACE".into(), workspace.display().to_string());
    env.insert("KILN_JOB".into(), job.name.clone());
    env.insert("KILN_RUN_ID".into(), ctx.run_id.to_string());
    env.insert("KILN_EVENT".into(), ctx.event.kind_name().to_string());
    if let Some(branch) = ctx.event.branch() {
        env.insert("KILN_BRANCH".into(), branch.to_string());
    }
    if let Some(sha) = ctx.event.sha() {
        env.insert("KILN_SHA".into(), sha.to_string());
    }
    env.extend(exports.iter().map(|(k, v)| (k.clone(), v.clone())));

    for layer in [&job.env, &step.env] {
        let expanded: Vec<(String, String)> = {
            let interpolator = Interpolator::new(&env, &ctx.event, &job.name, ctx.run_id);
            layer
                .iter()
                .map(|(k, v)| (k.clone(), interpolator.expand(v)))
                .collect()
        };
        env.extend(expanded);
    }

    env.insert("KILN_STEP_TEMP".into(), scratch.display().to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::event::TriggerEvent;
    use pretty_assertions::assert_eq;

    fn job() -> ExecutableJob {
        let mut job_env = IndexMap::new();
        job_env.insert("PROFILE".to_string(), "release".to_string());
        job_env.insert("TARGET_DIR".to_string(), "target/${{ env.PROFILE }}".to_string());
        let mut step_env = IndexMap::new();
        step_env.insert("PROFILE".to_string(), "dev".to_string());
        ExecutableJob {
            index: 0,
            name: "check".into(),
            runner_label: "local".into(),
            needs: Vec::new(),
            env: job_env,
            timeout: None,
            steps: vec![ExecutableStep {
                index: 0,
                name: "build".into(),
                env: step_env,
                timeout: None,
                kind: StepKind::Command {
                    run: "cargo build".into(),
                    shell: None,
                },
            }],
        }
    }

    #[test]
    fn test_step_env_layers() {
        let job = job();
        let ctx = RunContext::new(TriggerEvent::pull_request("main", "feature/x").with_sha("abc"))
            .with_variable("PROFILE", "from-run")
            .with_variable("EXTRA", "1");
        let mut exports = IndexMap::new();
        exports.insert("RUSTUP_TOOLCHAIN".to_string(), "stable".to_string());

        let env = step_env(
            &job,
            &job.steps[0],
            Path::new("/work"),
            Path::new("/work/tmp/step-0"),
            &ctx,
            &exports,
        );

        assert_eq!(env["CI"], "true");
        assert_eq!(env["KILN"], "true");
        assert_eq!(env["KILN_JOB"], "check");
        assert_eq!(env["KILN_EVENT"], "pull_request");
        assert_eq!(env["KILN_BRANCH"], "feature/x");
        assert_eq!(env["KILN_SHA"], "abc");
        assert_eq!(env["KILN_WORKSPACE"], "/work");
        assert_eq!(env["KILN_STEP_TEMP"], "/work/tmp/step-0");
        assert_eq!(env["RUSTUP_TOOLCHAIN"], "stable");
        assert_eq!(env["EXTRA"], "1");
        assert_eq!(env["TARGET_DIR"], "target/from-run");
        assert_eq!(env["PROFILE"], "dev");
    }

    #[test]
    fn test_errors_map_to_failure_kinds() {
        let job = job();
        let record = StepRecord::new(&job.steps[0], Utc::now());

        let result = record.errored(Error::StepFailed {
            exit_code: 127,
            message: "failed to spawn process".into(),
        });
        assert_eq!(result.status, StepStatus::Failure);
        assert_eq!(result.failure, Some(FailureKind::StepFailure));
        assert_eq!(result.exit_code, Some(127));

        let result = record.errored(Error::StepTimeout { seconds: 5 });
        assert_eq!(result.failure, Some(FailureKind::Timeout));

        let result = record.errored(Error::Cancelled {
            reason: "ctrl-c".into(),
        });
        assert_eq!(result.status, StepStatus::Cancelled);

        let result = record.errored(Error::ActionNotFound("actions/cache@v4".into()));
        assert_eq!(result.status, StepStatus::Failure);
        assert_eq!(result.failure, Some(FailureKind::StepFailure));
        assert!(result.error.unwrap().contains("actions/cache@v4"));
    }

    #[test]
    fn test_finish_maps_exits() {
        let job = job();
        let record = StepRecord::new(&job.steps[0], Utc::now());
        let timeout = Duration::from_secs(5);

        let ok = record.finish(
            &ActionOutcome::new(crate::runner::ProcessOutcome::exited(0, "done\n")),
            timeout,
        );
        assert_eq!(ok.status, StepStatus::Success);
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.output, "done\n");

        let failed = record.finish(
            &ActionOutcome::new(crate::runner::ProcessOutcome::exited(2, "")),
            timeout,
        );
        assert_eq!(failed.status, StepStatus::Failure);
        assert_eq!(failed.failure, Some(FailureKind::StepFailure));
        assert_eq!(failed.exit_code, Some(2));

        let timed_out = record.finish(
            &ActionOutcome::new(crate::runner::ProcessOutcome {
                exit: ProcessExit::TimedOut,
                output: String::new(),
                truncated: false,
            }),
            timeout,
        );
        assert_eq!(timed_out.failure, Some(FailureKind::Timeout));
        assert_eq!(timed_out.exit_code, None);
        assert_eq!(timed_out.error.as_deref(), Some("timed out after 5s"));
    }
}
