//! Step execution engine for kiln.
//!
//! Runs one job's steps in order inside a scoped workspace: shell commands
//! through [`ShellRunner`], reusable actions through the [`ActionRegistry`].

pub mod actions;
pub mod cache;
pub mod environments;
pub mod executor;
pub mod runner;
pub mod shell;

pub use actions::{ActionCall, ActionHandler, ActionOutcome, ActionRegistry};
pub use cache::ToolchainCache;
pub use environments::{EnvironmentProvider, HostEnvironmentProvider, JobEnvironment, StepScope};
pub use executor::JobExecutor;
pub use runner::{OutputLine, OutputStream, ProcessExit, ProcessOutcome, RunnerConfig, StepContext};
pub use shell::ShellRunner;
