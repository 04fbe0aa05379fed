//! Port traits.
//!
//! These traits are the seams between scheduling and execution, so that the
//! orchestrator and graph builder can be exercised without spawning processes.

use crate::event::TriggerEvent;
use crate::ids::RunId;
use crate::job::ExecutableJob;
use crate::pipeline::ActionRef;
use crate::run::JobResult;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Per-run values shared read-only by every job.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub event: TriggerEvent,
    /// Repository checked out by `actions/checkout`. Defaults to the
    /// current directory when unset.
    pub source: Option<PathBuf>,
    /// Run-wide variables, visible to every step.
    pub variables: IndexMap<String, String>,
}

impl RunContext {
    pub fn new(event: TriggerEvent) -> Self {
        Self {
            run_id: RunId::new(),
            event,
            source: None,
            variables: IndexMap::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

/// Runs a single job to a terminal status.
///
/// Implementations never fail: job-scoped errors are reported inside the
/// returned [`JobResult`]. When `cancel` fires the job should stop at the
/// next suspension point and report `Cancelled`.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &ExecutableJob, ctx: &RunContext, cancel: CancellationToken) -> JobResult;
}

/// Answers whether an action reference can be executed.
pub trait ActionCatalog: Send + Sync {
    fn resolves(&self, action: &ActionRef) -> bool;
}
