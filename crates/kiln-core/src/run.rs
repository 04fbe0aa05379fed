//! Run results and status aggregation.

use crate::ids::RunId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_SPEC_ERROR: i32 = 2;
pub const EXIT_TIMEOUT: i32 = 3;
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Cancelled | JobStatus::Skipped
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Running, Success)
                | (Running, Failure)
                | (Running, Cancelled)
        )
    }

    /// Move to `next`, rejecting transitions the job lifecycle does not allow.
    pub fn transition(self, next: JobStatus) -> Result<JobStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::Internal(format!(
                "illegal job transition {:?} -> {:?}",
                self, next
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failure | StepStatus::Cancelled | StepStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Why a step or job did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StepFailure,
    Timeout,
    Environment,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::StepFailure => "step_failure",
            FailureKind::Timeout => "timeout",
            FailureKind::Environment => "environment",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepResult {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Interleaved stdout/stderr, capped at the runner's output limit.
    pub output: String,
    #[serde(default)]
    pub output_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A step that was never invoked.
    pub fn skipped(index: usize, name: impl Into<String>) -> Self {
        Self::unstarted(index, name, StepStatus::Skipped)
    }

    fn unstarted(index: usize, name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            index,
            name: name.into(),
            status,
            failure: None,
            exit_code: None,
            output: String::new(),
            output_truncated: false,
            error: None,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn duration_ms(&self) -> Option<i64> {
        duration_ms(self.started_at, self.ended_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobResult {
    pub name: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps: Vec<StepResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobResult {
    /// Result for a job that never ran; every step is recorded `Skipped`.
    pub fn not_run<I, S>(name: impl Into<String>, status: JobStatus, step_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps = step_names
            .into_iter()
            .enumerate()
            .map(|(index, step)| StepResult::skipped(index, step))
            .collect();
        Self {
            name: name.into(),
            status,
            failure: (status == JobStatus::Cancelled).then_some(FailureKind::Cancelled),
            error: None,
            steps,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.failure == Some(FailureKind::Timeout)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        duration_ms(self.started_at, self.ended_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Failure,
    Cancelled,
}

impl PipelineStatus {
    /// Overall status: `Failure` if any job failed, else `Cancelled` if any
    /// job was cancelled, else `Success`.
    pub fn aggregate<'a, I>(jobs: I) -> Self
    where
        I: IntoIterator<Item = &'a JobResult>,
    {
        let mut cancelled = false;
        for job in jobs {
            match job.status {
                JobStatus::Failure => return PipelineStatus::Failure,
                JobStatus::Cancelled => cancelled = true,
                _ => {}
            }
        }
        if cancelled {
            PipelineStatus::Cancelled
        } else {
            PipelineStatus::Success
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Success => "success",
            PipelineStatus::Failure => "failure",
            PipelineStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineResult {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    pub status: PipelineStatus,
    /// Whether the run received a cancellation request.
    pub cancelled: bool,
    /// Job results in declaration order.
    pub jobs: Vec<JobResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl PipelineResult {
    pub fn new(
        run_id: RunId,
        jobs: Vec<JobResult>,
        cancelled: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            pipeline: None,
            status: PipelineStatus::aggregate(&jobs),
            cancelled,
            jobs,
            started_at,
            ended_at: Utc::now(),
        }
    }

    pub fn with_pipeline_name(mut self, name: Option<String>) -> Self {
        self.pipeline = name;
        self
    }

    pub fn job(&self, name: &str) -> Option<&JobResult> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            PipelineStatus::Success => EXIT_SUCCESS,
            PipelineStatus::Cancelled => EXIT_CANCELLED,
            PipelineStatus::Failure if self.jobs.iter().any(JobResult::is_timeout) => EXIT_TIMEOUT,
            PipelineStatus::Failure => EXIT_FAILURE,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

fn duration_ms(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    match (start, end) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
        _ => None,
    }
}
