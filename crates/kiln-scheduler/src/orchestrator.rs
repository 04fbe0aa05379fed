//! Pipeline orchestration.
//!
//! Runs every job of a [`JobGraph`] on a bounded pool of workers, starting a
//! job once all of its `needs` are terminal, and aggregates the results.

use crate::graph::JobGraph;
use chrono::Utc;
use kiln_core::job::ExecutableJob;
use kiln_core::ports::{JobRunner, RunContext};
use kiln_core::run::{JobResult, JobStatus, PipelineResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of jobs running at once.
    pub max_parallel: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }
}

enum Readiness<'a> {
    Ready,
    Waiting,
    /// A dependency finished without succeeding.
    Blocked(&'a str),
}

pub struct Orchestrator {
    runner: Arc<dyn JobRunner>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn JobRunner>, config: OrchestratorConfig) -> Self {
        Self { runner, config }
    }

    /// Run all jobs to a terminal status.
    ///
    /// When `cancel` fires no further jobs start, unstarted jobs are recorded
    /// `Cancelled`, and running jobs are left to observe the token. Results of
    /// jobs that already finished are kept.
    pub async fn execute(
        &self,
        graph: &JobGraph,
        ctx: RunContext,
        cancel: CancellationToken,
    ) -> PipelineResult {
        let started_at = Utc::now();
        let run_id = ctx.run_id;
        let ctx = Arc::new(ctx);
        let jobs = graph.jobs();
        let max_parallel = self.config.max_parallel.max(1);
        let semaphore = Arc::new(Semaphore::new(max_parallel));

        info!(
            run_id = %run_id,
            jobs = jobs.len(),
            max_parallel,
            "Starting pipeline run"
        );

        let mut results: HashMap<String, JobResult> = HashMap::new();
        let mut pending: Vec<&ExecutableJob> = jobs.iter().collect();
        let mut running: HashMap<tokio::task::Id, &ExecutableJob> = HashMap::new();
        let mut join_set = JoinSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled {
                // Repeat until a pass makes no progress so skips cascade.
                loop {
                    let before = pending.len();
                    let mut waiting = Vec::with_capacity(pending.len());
                    for job in pending.drain(..) {
                        match readiness(job, &results) {
                            Readiness::Ready => {
                                let id = self.spawn_job(
                                    &mut join_set,
                                    job,
                                    &ctx,
                                    &semaphore,
                                    &cancel,
                                );
                                running.insert(id, job);
                            }
                            Readiness::Waiting => waiting.push(job),
                            Readiness::Blocked(dependency) => {
                                info!(job = %job.name, dependency, "Skipping job, dependency did not succeed");
                                let result = job.not_run(JobStatus::Skipped).with_error(format!(
                                    "dependency `{}` did not succeed",
                                    dependency
                                ));
                                results.insert(job.name.clone(), result);
                            }
                        }
                    }
                    pending = waiting;
                    if pending.len() == before {
                        break;
                    }
                }
            }

            if join_set.is_empty() {
                // Dependencies are acyclic, so anything left here was never
                // reachable; record it rather than waiting forever.
                for job in pending.drain(..) {
                    warn!(job = %job.name, "Job could not be scheduled");
                    results.insert(job.name.clone(), job.not_run(JobStatus::Skipped));
                }
                break;
            }

            tokio::select! {
                joined = join_set.join_next_with_id() => match joined {
                    Some(Ok((id, result))) => {
                        running.remove(&id);
                        info!(
                            job = %result.name,
                            status = result.status.as_str(),
                            duration_ms = result.duration_ms().unwrap_or(0),
                            "Job finished"
                        );
                        results.insert(result.name.clone(), result);
                    }
                    Some(Err(err)) => {
                        if let Some(job) = running.remove(&err.id()) {
                            warn!(job = %job.name, error = %err, "Job task aborted");
                            let result = job
                                .not_run(JobStatus::Failure)
                                .with_error(format!("job task aborted: {}", err));
                            results.insert(job.name.clone(), result);
                        }
                    }
                    None => {}
                },
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    info!(
                        run_id = %run_id,
                        running = running.len(),
                        unstarted = pending.len(),
                        "Run cancelled"
                    );
                    for job in pending.drain(..) {
                        results.insert(job.name.clone(), job.not_run(JobStatus::Cancelled));
                    }
                }
            }
        }

        let ordered = jobs
            .iter()
            .map(|job| {
                results
                    .remove(&job.name)
                    .unwrap_or_else(|| job.not_run(JobStatus::Cancelled))
            })
            .collect();

        let result = PipelineResult::new(run_id, ordered, cancelled || cancel.is_cancelled(), started_at);
        info!(
            run_id = %run_id,
            status = result.status.as_str(),
            duration_ms = result.duration_ms(),
            "Pipeline run finished"
        );
        result
    }

    fn spawn_job(
        &self,
        join_set: &mut JoinSet<JobResult>,
        job: &ExecutableJob,
        ctx: &Arc<RunContext>,
        semaphore: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> tokio::task::Id {
        let job = job.clone();
        let ctx = Arc::clone(ctx);
        let semaphore = Arc::clone(semaphore);
        let token = cancel.child_token();
        let runner = Arc::clone(&self.runner);

        debug!(job = %job.name, "Queueing job");

        let handle = join_set.spawn(async move {
            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit,
                _ = token.cancelled() => return job.not_run(JobStatus::Cancelled),
            };
            let Ok(_permit) = permit else {
                return job.not_run(JobStatus::Cancelled);
            };
            if token.is_cancelled() {
                return job.not_run(JobStatus::Cancelled);
            }

            debug!(job = %job.name, "Starting job");
            runner.run(&job, &ctx, token).await
        });
        handle.id()
    }
}

fn readiness<'a>(job: &'a ExecutableJob, results: &HashMap<String, JobResult>) -> Readiness<'a> {
    for dependency in &job.needs {
        match results.get(dependency) {
            None => return Readiness::Waiting,
            Some(result) if result.status == JobStatus::Success => {}
            Some(_) => return Readiness::Blocked(dependency),
        }
    }
    Readiness::Ready
}
