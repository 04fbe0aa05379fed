//! Validated, executable form of a pipeline's jobs.

use crate::pipeline::ActionRef;
use crate::run::{JobResult, JobStatus};
use indexmap::IndexMap;
use std::time::Duration;

/// A job that passed validation and is ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableJob {
    /// Position in the declaration.
    pub index: usize,
    pub name: String,
    pub runner_label: String,
    pub needs: Vec<String>,
    pub env: IndexMap<String, String>,
    /// Limit on the whole job; also the default step timeout.
    pub timeout: Option<Duration>,
    pub steps: Vec<ExecutableStep>,
}

impl ExecutableJob {
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    /// Result for this job when it is never started.
    pub fn not_run(&self, status: JobStatus) -> JobResult {
        JobResult::not_run(&self.name, status, self.step_names())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutableStep {
    pub index: usize,
    pub name: String,
    pub env: IndexMap<String, String>,
    pub timeout: Option<Duration>,
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Action {
        action: ActionRef,
        with: IndexMap<String, serde_json::Value>,
    },
    Command {
        run: String,
        shell: Option<String>,
    },
}

impl ExecutableStep {
    /// Effective timeout: the step's own, else the job's, else `default`.
    pub fn effective_timeout(&self, job: &ExecutableJob, default: Duration) -> Duration {
        self.timeout.or(job.timeout).unwrap_or(default)
    }
}
