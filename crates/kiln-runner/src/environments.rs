//! Scoped execution environments.
//!
//! A job owns one [`JobEnvironment`] for its lifetime: a fresh workspace
//! directory plus a scratch area. Each step gets its own [`StepScope`] under
//! the scratch area, removed as soon as the step ends.

use async_trait::async_trait;
use kiln_core::job::ExecutableJob;
use kiln_core::{Error, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Acquires job environments.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn acquire(&self, job: &ExecutableJob) -> Result<JobEnvironment>;
}

/// Host environment provider: temporary directories on the local disk.
#[derive(Debug, Clone)]
pub struct HostEnvironmentProvider {
    root: PathBuf,
    keep_workspaces: bool,
}

impl HostEnvironmentProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep_workspaces: false,
        }
    }

    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }
}

impl Default for HostEnvironmentProvider {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

#[async_trait]
impl EnvironmentProvider for HostEnvironmentProvider {
    async fn acquire(&self, job: &ExecutableJob) -> Result<JobEnvironment> {
        let root = self.root.clone();
        let keep = self.keep_workspaces;
        let prefix = format!("kiln-{}-", sanitize(&job.name));

        let env = tokio::task::spawn_blocking(move || JobEnvironment::create(&root, &prefix, keep))
            .await
            .map_err(|e| Error::Environment(format!("workspace setup aborted: {}", e)))??;

        info!(job = %job.name, workspace = %env.workspace().display(), "Prepared host environment");
        Ok(env)
    }
}

/// A job's exclusive workspace.
///
/// Released explicitly with [`JobEnvironment::release`]; dropping it without
/// releasing still removes the directory unless workspaces are kept.
#[derive(Debug)]
pub struct JobEnvironment {
    root: TempDir,
    workspace: PathBuf,
    scratch: PathBuf,
    keep: bool,
}

impl JobEnvironment {
    fn create(parent: &Path, prefix: &str, keep: bool) -> Result<Self> {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::Environment(format!("cannot create {}: {}", parent.display(), e))
        })?;
        let root = tempfile::Builder::new()
            .prefix(prefix)
            .keep(keep)
            .tempdir_in(parent)
            .map_err(|e| Error::Environment(format!("cannot create workspace: {}", e)))?;

        let workspace = root.path().join("workspace");
        let scratch = root.path().join("tmp");
        for dir in [&workspace, &scratch] {
            std::fs::create_dir(dir).map_err(|e| {
                Error::Environment(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }

        Ok(Self {
            root,
            workspace,
            scratch,
            keep,
        })
    }

    /// Working directory for every step of the job.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Create the scratch scope for one step.
    pub fn enter_step(&self, index: usize) -> Result<StepScope> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("step-{}-", index))
            .keep(self.keep)
            .tempdir_in(&self.scratch)
            .map_err(|e| Error::Environment(format!("cannot create step scratch dir: {}", e)))?;
        debug!(step = index, dir = %dir.path().display(), "Entered step scope");
        Ok(StepScope { dir })
    }

    /// Remove the workspace (unless kept).
    pub async fn release(self) -> Result<()> {
        let path = self.root.path().to_path_buf();
        if self.keep {
            info!(workspace = %path.display(), "Keeping workspace");
            return Ok(());
        }
        let root = self.root;
        tokio::task::spawn_blocking(move || root.close())
            .await
            .map_err(|e| Error::Environment(format!("workspace cleanup aborted: {}", e)))?
            .map_err(|e| {
                warn!(workspace = %path.display(), error = %e, "Failed to remove workspace");
                Error::Environment(format!("cannot remove {}: {}", path.display(), e))
            })?;
        debug!(workspace = %path.display(), "Removed workspace");
        Ok(())
    }
}

/// Per-step scratch directory, exported as `KILN_STEP_TEMP`.
#[derive(Debug)]
pub struct StepScope {
    dir: TempDir,
}

impl StepScope {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn release(self) -> Result<()> {
        self.dir
            .close()
            .map_err(|e| Error::Environment(format!("cannot remove step scratch dir: {}", e)))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn job(name: &str) -> ExecutableJob {
        ExecutableJob {
            index: 0,
            name: name.to_string(),
            runner_label: "local".into(),
            needs: Vec::new(),
            env: IndexMap::new(),
            timeout: None,
            steps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_workspace_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let provider = HostEnvironmentProvider::new(root.path());

        let env = provider.acquire(&job("check")).await.unwrap();
        let workspace = env.workspace().to_path_buf();
        assert!(workspace.is_dir());
        assert!(workspace.starts_with(root.path()));

        let scope = env.enter_step(0).unwrap();
        let scratch = scope.path().to_path_buf();
        assert!(scratch.is_dir());
        scope.release().unwrap();
        assert!(!scratch.exists());

        env.release().await.unwrap();
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn test_jobs_get_distinct_workspaces() {
        let root = tempfile::tempdir().unwrap();
        let provider = HostEnvironmentProvider::new(root.path());

        let a = provider.acquire(&job("fmt")).await.unwrap();
        let b = provider.acquire(&job("fmt")).await.unwrap();
        assert_ne!(a.workspace(), b.workspace());

        a.release().await.unwrap();
        b.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_keep_workspaces() {
        let root = tempfile::tempdir().unwrap();
        let provider = HostEnvironmentProvider::new(root.path()).with_keep_workspaces(true);

        let env = provider.acquire(&job("clippy")).await.unwrap();
        let workspace = env.workspace().to_path_buf();
        env.release().await.unwrap();
        assert!(workspace.exists());
    }

    #[tokio::test]
    async fn test_drop_removes_workspace() {
        let root = tempfile::tempdir().unwrap();
        let provider = HostEnvironmentProvider::new(root.path());

        let env = provider.acquire(&job("check")).await.unwrap();
        let workspace = env.workspace().to_path_buf();
        drop(env);
        assert!(!workspace.exists());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("build/linux x86"), "build_linux_x86");
        assert_eq!(sanitize("fmt-check_1"), "fmt-check_1");
    }
}
