use super::{ActionCall, ActionHandler, ActionOutcome};
use crate::shell::ShellRunner;
use async_trait::async_trait;
use kiln_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// `actions/checkout`: clones the run's source repository into the job
/// workspace.
///
/// Inputs: `repository` (path or URL, defaults to the run's source),
/// `ref` (defaults to the event's commit, if any) and `path` (relative to
/// the workspace).
pub struct CheckoutAction {
    shell: Arc<ShellRunner>,
}

impl CheckoutAction {
    pub fn new(shell: Arc<ShellRunner>) -> Self {
        Self { shell }
    }

    fn source(&self, call: &ActionCall<'_>) -> Result<String> {
        if let Some(repository) = call.param_str("repository") {
            return Ok(repository);
        }
        let source = match &call.run.source {
            Some(path) => path.clone(),
            None => std::env::current_dir().map_err(|e| {
                Error::Action(format!("cannot determine repository to check out: {}", e))
            })?,
        };
        Ok(source.to_string_lossy().into_owned())
    }
}

#[async_trait]
impl ActionHandler for CheckoutAction {
    fn name(&self) -> &str {
        "actions/checkout"
    }

    async fn execute(&self, call: &ActionCall<'_>, cancel: &CancellationToken) -> Result<ActionOutcome> {
        let source = self.source(call)?;
        let dest: PathBuf = match call.param_str("path") {
            Some(path) => call.step.workspace.join(path),
            None => call.step.workspace.clone(),
        };
        let git_ref = call
            .param_str("ref")
            .or_else(|| call.run.event.sha().map(String::from));

        info!(
            job = %call.step.job,
            source = %source,
            git_ref = git_ref.as_deref().unwrap_or("HEAD"),
            dest = %dest.display(),
            "Checking out repository"
        );

        let dest_arg = dest.to_string_lossy().into_owned();
        let clone = self
            .shell
            .run_program("git", ["clone", "--quiet", source.as_str(), dest_arg.as_str()], call.step, cancel)
            .await?;
        if !clone.success() {
            return Ok(ActionOutcome::new(clone));
        }

        let outcome = match git_ref {
            Some(git_ref) => {
                let checkout = self
                    .shell
                    .run_program(
                        "git",
                        ["-C", dest_arg.as_str(), "checkout", "--quiet", "--detach", git_ref.as_str()],
                        call.step,
                        cancel,
                    )
                    .await?;
                clone.then(checkout)
            }
            None => clone,
        };

        Ok(ActionOutcome::new(outcome))
    }
}
