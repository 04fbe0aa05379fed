use super::{ActionCall, ActionHandler, ActionOutcome};
use crate::cache::ToolchainCache;
use crate::runner::{ProcessExit, ProcessOutcome};
use crate::shell::ShellRunner;
use async_trait::async_trait;
use kiln_core::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Action versions that name a release of the action rather than a toolchain.
const NON_TOOLCHAIN_VERSIONS: &[&str] = &["master", "main", "v1"];

/// `dtolnay/rust-toolchain`: installs a toolchain with rustup and selects it
/// for the job's later steps through `RUSTUP_TOOLCHAIN`.
///
/// The toolchain is the action version (`@stable`, `@1.80.0`) unless a
/// `toolchain` input is given. `components` and `targets` accept a list or a
/// comma separated string. Installs go through the shared
/// [`ToolchainCache`], so each combination is installed once per process.
pub struct RustToolchainAction {
    shell: Arc<ShellRunner>,
    cache: ToolchainCache,
}

impl RustToolchainAction {
    pub fn new(shell: Arc<ShellRunner>, cache: ToolchainCache) -> Self {
        Self { shell, cache }
    }

    fn toolchain(call: &ActionCall<'_>) -> Result<String> {
        if let Some(toolchain) = call.param_str("toolchain") {
            return Ok(toolchain);
        }
        if NON_TOOLCHAIN_VERSIONS.contains(&call.action.version.as_str()) {
            return Err(Error::Action(format!(
                "{} requires a `toolchain` input",
                call.action
            )));
        }
        Ok(call.action.version.clone())
    }
}

/// Cache key for a toolchain plus its extras.
fn cache_key(toolchain: &str, components: &[String], targets: &[String]) -> String {
    let mut components = components.to_vec();
    components.sort();
    let mut targets = targets.to_vec();
    targets.sort();
    format!(
        "{}|components={}|targets={}",
        toolchain,
        components.join(","),
        targets.join(",")
    )
}

fn install_args(toolchain: &str, components: &[String], targets: &[String]) -> Vec<String> {
    let mut args = vec![
        "toolchain".to_string(),
        "install".to_string(),
        toolchain.to_string(),
        "--profile".to_string(),
        "minimal".to_string(),
        "--no-self-update".to_string(),
    ];
    for component in components {
        args.push("--component".to_string());
        args.push(component.clone());
    }
    for target in targets {
        args.push("--target".to_string());
        args.push(target.clone());
    }
    args
}

#[async_trait]
impl ActionHandler for RustToolchainAction {
    fn name(&self) -> &str {
        "dtolnay/rust-toolchain"
    }

    async fn execute(&self, call: &ActionCall<'_>, cancel: &CancellationToken) -> Result<ActionOutcome> {
        let toolchain = Self::toolchain(call)?;
        let components = call.param_list("components");
        let targets = call.param_list("targets");
        let key = cache_key(&toolchain, &components, &targets);

        info!(job = %call.step.job, toolchain = %toolchain, "Installing Rust toolchain");

        let mut install_outcome: Option<ProcessOutcome> = None;
        let slot = &mut install_outcome;
        let args = install_args(&toolchain, &components, &targets);
        let shell = &self.shell;

        let status = self
            .cache
            .get_or_install(&key, call.step, cancel, move || async move {
                let outcome = shell.run_program("rustup", &args, call.step, cancel).await?;
                let result = match outcome.exit {
                    ProcessExit::Exited(0) => Ok(()),
                    ProcessExit::Exited(code) => Err(Error::StepFailed {
                        exit_code: code,
                        message: "rustup toolchain install failed".to_string(),
                    }),
                    ProcessExit::TimedOut => Err(Error::StepTimeout {
                        seconds: call.step.timeout.as_secs(),
                    }),
                    ProcessExit::Cancelled => Err(Error::Cancelled {
                        reason: "toolchain install interrupted".to_string(),
                    }),
                };
                *slot = Some(outcome);
                result
            })
            .await;

        let process = match (status, install_outcome) {
            (Ok(_), Some(outcome)) => outcome,
            (Ok(_), None) => {
                ProcessOutcome::exited(0, format!("toolchain {} already installed\n", toolchain))
            }
            // A failed install still reports the process's own exit.
            (Err(_), Some(outcome)) => outcome,
            (Err(e), None) => return Err(e),
        };

        Ok(ActionOutcome::new(process).with_export("RUSTUP_TOOLCHAIN", toolchain))
    }
}
