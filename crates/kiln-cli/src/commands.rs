//! CLI command definitions.

use crate::config::OutputFormat;
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline locally
    Run(RunArgs),

    /// Validate a pipeline declaration
    Validate {
        /// Path to the pipeline file (discovered when omitted)
        file: Option<PathBuf>,
    },

    /// Show whether an event triggers the pipeline and which jobs would run
    Plan {
        /// Path to the pipeline file (discovered when omitted)
        file: Option<PathBuf>,

        #[command(flatten)]
        event: EventArgs,
    },

    /// Write a starter pipeline
    Init {
        /// Where to write the pipeline
        #[arg(default_value = ".kiln/pipeline.yaml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the JSON schema of the pipeline format
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// The repository event to evaluate triggers against.
#[derive(Args, Debug, Clone)]
pub struct EventArgs {
    /// Event kind (push, pull_request)
    #[arg(long, default_value = "push")]
    pub event: String,

    /// Branch pushed to, or the pull request head (defaults to the current git branch)
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Pull request base branch
    #[arg(long)]
    pub base: Option<String>,

    /// Commit the event refers to
    #[arg(long)]
    pub sha: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to the pipeline file (discovered when omitted)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    #[command(flatten)]
    pub event: EventArgs,

    /// Maximum number of jobs running at once
    #[arg(short = 'j', long)]
    pub max_parallel: Option<usize>,

    /// Default step timeout in minutes
    #[arg(long)]
    pub step_timeout: Option<u64>,

    /// Report format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Leave job workspaces on disk
    #[arg(long)]
    pub keep_workspaces: bool,

    /// Run even if no trigger matches the event
    #[arg(long)]
    pub force: bool,

    /// Repository cloned by actions/checkout (defaults to the current directory)
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Run variable visible to every step, as KEY=VALUE
    #[arg(short = 'e', long = "var", value_parser = parse_key_val)]
    pub vars: Vec<(String, String)>,

    /// Stream step output to stderr while jobs run
    #[arg(long)]
    pub stream: bool,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no `=` found in `{}`", s))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}
