//! CLI configuration management.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration, persisted as YAML. Command-line flags override it.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CliConfig {
    /// Report format.
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Maximum number of jobs running at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    /// Default step timeout in minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_minutes: Option<u64>,
    /// Seconds between SIGTERM and SIGKILL when a step is stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_grace_seconds: Option<u64>,
    /// Shell for `run` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Parent directory for job workspaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
    /// Leave job workspaces on disk.
    #[serde(default)]
    pub keep_workspaces: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

impl CliConfig {
    /// Load the user's configuration. A missing file yields the defaults.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// `<config dir>/kiln/config.yaml` for the current user.
    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dirs = directories::ProjectDirs::from("dev", "kiln", "kiln")
            .ok_or("no home directory to keep kiln configuration in")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Update one key from its string form, as given to `kiln config set`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let invalid = || format!("Invalid value for {}: {}", key, value);
        match key {
            "output_format" => {
                self.output_format = OutputFormat::from_str(value, true)
                    .map_err(|_| format!("Invalid output format: {} (table, json or yaml)", value))?;
            }
            "max_parallel" => self.max_parallel = Some(parse_positive(key, value)? as usize),
            "step_timeout_minutes" => self.step_timeout_minutes = Some(parse_positive(key, value)?),
            "kill_grace_seconds" => {
                self.kill_grace_seconds = Some(value.parse().map_err(|_| invalid())?);
            }
            "shell" => self.shell = Some(value.to_string()),
            "workspace_root" => self.workspace_root = Some(PathBuf::from(value)),
            "keep_workspaces" => self.keep_workspaces = value.parse().map_err(|_| invalid())?,
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64, String> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("Invalid value for {}: {} (expected a positive integer)", key, value)),
    }
}
