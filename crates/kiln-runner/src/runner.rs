//! Core runner types.

use indexmap::IndexMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub job: String,
    pub step: usize,
    pub stream: OutputStream,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Configuration for step execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Step timeout when neither the step nor its job sets one.
    pub default_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when a step is stopped.
    pub kill_grace: Duration,
    /// Captured output kept per step.
    pub max_output_bytes: usize,
    /// Shell used for `run` steps without an explicit `shell`.
    pub shell: String,
    /// Parent directory for job workspaces. System temp dir when unset.
    pub workspace_root: Option<PathBuf>,
    /// Leave job workspaces on disk after the job finishes.
    pub keep_workspaces: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60 * 60),
            kill_grace: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024,
            shell: "sh".to_string(),
            workspace_root: None,
            keep_workspaces: false,
        }
    }
}

impl RunnerConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn with_keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }
}

/// Everything a process needs to run as part of one step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job: String,
    pub step: usize,
    pub workspace: PathBuf,
    pub scratch_dir: PathBuf,
    /// Complete environment passed to the process, on top of the inherited one.
    pub env: IndexMap<String, String>,
    pub timeout: Duration,
    /// Point after which the step is considered timed out. Shared by every
    /// process the step spawns.
    pub deadline: tokio::time::Instant,
    pub output: Option<mpsc::Sender<OutputLine>>,
}

impl StepContext {
    pub fn new(job: impl Into<String>, step: usize, workspace: impl Into<PathBuf>, timeout: Duration) -> Self {
        let workspace = workspace.into();
        Self {
            job: job.into(),
            step,
            scratch_dir: workspace.clone(),
            workspace,
            env: IndexMap::new(),
            timeout,
            deadline: tokio::time::Instant::now() + timeout,
            output: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    pub fn with_env(mut self, env: IndexMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_output(mut self, output: Option<mpsc::Sender<OutputLine>>) -> Self {
        self.output = output;
        self
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(i32),
    TimedOut,
    Cancelled,
}

/// Exit and captured output of one or more processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit: ProcessExit,
    pub output: String,
    pub truncated: bool,
}

impl ProcessOutcome {
    pub fn exited(code: i32, output: impl Into<String>) -> Self {
        Self {
            exit: ProcessExit::Exited(code),
            output: output.into(),
            truncated: false,
        }
    }

    pub fn success(&self) -> bool {
        self.exit == ProcessExit::Exited(0)
    }

    /// Append a later process's outcome; its exit status wins.
    pub fn then(mut self, next: ProcessOutcome) -> Self {
        self.output.push_str(&next.output);
        self.truncated |= next.truncated;
        self.exit = next.exit;
        self
    }
}

/// Bounded capture buffer for interleaved stdout/stderr.
#[derive(Debug)]
pub(crate) struct OutputBuffer {
    content: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            content: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append a line. The first line that does not fit is kept up to the
    /// limit and everything after it is dropped.
    pub(crate) fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.content.len());
        if line.len() < room {
            self.content.push_str(line);
            self.content.push('\n');
            return;
        }
        let mut end = room.min(line.len());
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        self.content.push_str(&line[..end]);
        self.truncated = true;
    }

    pub(crate) fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    pub(crate) fn take(&mut self) -> (String, bool) {
        (std::mem::take(&mut self.content), self.truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_limit() {
        let mut buffer = OutputBuffer::new(12);
        buffer.push_line("hello");
        buffer.push_line("world");
        buffer.push_line("dropped");
        buffer.push_line("x");
        let (content, truncated) = buffer.take();
        assert_eq!(content, "hello\nworld\n");
        assert!(truncated);
    }

    #[test]
    fn test_output_buffer_keeps_prefix_of_long_line() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push_line("ok");
        buffer.push_line("abcdefghij");
        buffer.push_line("after");
        let (content, truncated) = buffer.take();
        assert_eq!(content, "ok\nabcde");
        assert!(truncated);
    }

    #[test]
    fn test_output_buffer_cuts_on_char_boundary() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push_line("aéé");
        let (content, truncated) = buffer.take();
        assert_eq!(content, "aé");
        assert!(truncated);
    }

    #[test]
    fn test_outcome_then() {
        let first = ProcessOutcome::exited(0, "cloned\n");
        let second = ProcessOutcome::exited(1, "bad ref\n");
        let combined = first.then(second);
        assert_eq!(combined.exit, ProcessExit::Exited(1));
        assert_eq!(combined.output, "cloned\nbad ref\n");
        assert!(!combined.success());
    }

    #[test]
    fn test_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.default_timeout, Duration::from_secs(3600));
        assert_eq!(config.kill_grace, Duration::from_secs(10));
        assert_eq!(config.max_output_bytes, 1024 * 1024);
        assert_eq!(config.shell, "sh");
    }
}
