//! Process execution on the host.

use crate::runner::{
    OutputBuffer, OutputLine, OutputStream, ProcessExit, ProcessOutcome, RunnerConfig, StepContext,
};
use kiln_core::{Error, Result};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to keep reading output after the process exits. Background
/// children that inherited the pipes would otherwise hold the step open.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest single line kept from a process; the remainder is discarded.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Runs step processes in their own process group.
pub struct ShellRunner {
    config: RunnerConfig,
}

impl ShellRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run a script through `shell -c`, or the configured shell.
    pub async fn run_script(
        &self,
        script: &str,
        shell: Option<&str>,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        let shell = shell.unwrap_or(&self.config.shell);
        info!(job = %ctx.job, step = ctx.step, shell, "Executing shell command");
        debug!(command = %script, workspace = %ctx.workspace.display());

        let mut command = Command::new(shell);
        command.arg("-c").arg(script);
        self.execute(command, ctx, cancel).await
    }

    /// Run a program with arguments, without a shell.
    pub async fn run_program<I, S>(
        &self,
        program: &str,
        args: I,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        info!(job = %ctx.job, step = ctx.step, program, "Executing program");
        let mut command = Command::new(program);
        command.args(args);
        self.execute(command, ctx, cancel).await
    }

    async fn execute(
        &self,
        mut command: Command,
        ctx: &StepContext,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        command
            .current_dir(&ctx.workspace)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            Error::StepFailed {
                exit_code: 127,
                message: format!("failed to spawn process: {}", e),
            }
        })?;

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.config.max_output_bytes)));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(stream_output(
                stdout,
                OutputStream::Stdout,
                output_target(ctx),
                Arc::clone(&buffer),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(stream_output(
                stderr,
                OutputStream::Stderr,
                output_target(ctx),
                Arc::clone(&buffer),
            )));
        }

        enum ExitReason {
            Completed(std::process::ExitStatus),
            WaitError(std::io::Error),
            Timeout,
            Cancelled,
        }

        let exit_reason = tokio::select! {
            wait_result = child.wait() => match wait_result {
                Ok(status) => ExitReason::Completed(status),
                Err(e) => ExitReason::WaitError(e),
            },
            _ = tokio::time::sleep_until(ctx.deadline) => ExitReason::Timeout,
            _ = cancel.cancelled() => ExitReason::Cancelled,
        };

        let exit = match exit_reason {
            ExitReason::Completed(status) => ProcessExit::Exited(exit_code(status)),
            ExitReason::WaitError(e) => {
                terminate_process_group(&mut child, self.config.kill_grace).await;
                return Err(Error::Io(e));
            }
            ExitReason::Timeout => {
                warn!(
                    job = %ctx.job,
                    step = ctx.step,
                    timeout_secs = ctx.timeout.as_secs(),
                    "Step timed out, terminating process group"
                );
                terminate_process_group(&mut child, self.config.kill_grace).await;
                ProcessExit::TimedOut
            }
            ExitReason::Cancelled => {
                info!(job = %ctx.job, step = ctx.step, "Step cancelled, terminating process group");
                terminate_process_group(&mut child, self.config.kill_grace).await;
                ProcessExit::Cancelled
            }
        };

        let drain = join_readers(&mut readers);
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(job = %ctx.job, step = ctx.step, "Output still open after exit, detaching readers");
            for reader in &readers {
                reader.abort();
            }
        }

        let (output, truncated) = match buffer.lock() {
            Ok(mut buffer) => buffer.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        debug!(job = %ctx.job, step = ctx.step, exit = ?exit, "Process finished");

        Ok(ProcessOutcome {
            exit,
            output,
            truncated,
        })
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

/// Identity of a step for output forwarding.
struct OutputTarget {
    job: String,
    step: usize,
    tx: Option<mpsc::Sender<OutputLine>>,
}

fn output_target(ctx: &StepContext) -> OutputTarget {
    OutputTarget {
        job: ctx.job.clone(),
        step: ctx.step,
        tx: ctx.output.clone(),
    }
}

async fn stream_output<R>(
    reader: R,
    stream: OutputStream,
    target: OutputTarget,
    buffer: Arc<Mutex<OutputBuffer>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        match read_line_bounded(&mut reader, &mut raw, MAX_LINE_BYTES).await {
            Ok(None) => break,
            Ok(Some(clipped)) => {
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end_matches(['\n', '\r']);
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.push_line(line);
                    if clipped {
                        buffer.mark_truncated();
                    }
                }
                if let Some(tx) = &target.tx {
                    let output = OutputLine {
                        job: target.job.clone(),
                        step: target.step,
                        stream,
                        content: line.to_string(),
                        timestamp: chrono::Utc::now(),
                    };
                    // A closed receiver only stops forwarding, never capture.
                    let _ = tx.send(output).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Error reading process output");
                break;
            }
        }
    }
}

/// Read one line into `line`, keeping at most `max` bytes of it. The rest of
/// an over-long line is consumed and dropped, so memory stays bounded no
/// matter what the process writes.
///
/// Returns `None` at end of input, otherwise whether the line was clipped.
async fn read_line_bounded<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut consumed = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((consumed > 0).then_some(consumed > line.len()));
        }
        let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        let room = max.saturating_sub(line.len());
        line.extend_from_slice(&chunk[..chunk.len().min(room)]);
        let used = chunk.len();
        consumed += used;
        reader.consume(used);
        if done {
            // The newline itself does not count against the limit.
            let kept = line.len() - usize::from(line.last() == Some(&b'\n'));
            return Ok(Some(consumed - 1 > kept));
        }
    }
}

async fn join_readers(readers: &mut [tokio::task::JoinHandle<()>]) {
    for reader in readers.iter_mut() {
        let _ = reader.await;
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Terminate a process group: SIGTERM, wait for the grace period, then
/// SIGKILL, then reap.
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return; // Already reaped
    };
    let pgid = Pid::from_raw(-(pid as i32));

    if let Err(e) = signal::kill(pgid, Signal::SIGTERM)
        && e != nix::errno::Errno::ESRCH
    {
        warn!(pid, error = ?e, "SIGTERM to process group failed");
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.try_wait().ok().flatten().is_some() {
            // Leader exited; make sure nothing in the group outlives it.
            let _ = signal::kill(pgid, Signal::SIGKILL);
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if let Err(e) = signal::kill(pgid, Signal::SIGKILL)
        && e != nix::errno::Errno::ESRCH
    {
        warn!(pid, error = ?e, "SIGKILL to process group failed");
    }

    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}
