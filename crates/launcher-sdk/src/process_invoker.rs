use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The default duration to wait after sending SIGINT before escalating to SIGTERM.
pub const DEFAULT_SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// The default duration to wait after sending SIGTERM before escalating to SIGKILL.
pub const DEFAULT_SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);
/// How long the stream readers may keep draining after the process is gone.
/// A grandchild that inherited the pipes can hold them open indefinitely.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for non-zero process exit codes.
#[derive(Debug, thiserror::Error)]
#[error("Exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'.")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
}

/// Event data for a line received from stdout or stderr.
#[derive(Debug, Clone)]
pub struct ProcessDataReceivedEventArgs {
    pub data: String,
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited on its own with the given code.
    Exited(i32),
    /// Cancellation was requested and the process was stopped; carries the
    /// exit code observed after the stop.
    Cancelled(i32),
}

impl ProcessOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcessOutcome::Exited(code) | ProcessOutcome::Cancelled(code) => *code,
        }
    }
}

/// Spawns a child process, reads stdout/stderr line by line on separate tasks,
/// and stops the process on cancellation with SIGINT → SIGTERM → SIGKILL.
///
/// On Unix the child becomes the leader of a new process group and every
/// signal goes to the whole group, so wrapper scripts and the programs they
/// start are stopped together.
///
/// Output lines are delivered through channels. `execute` consumes the
/// invoker, so both channels close once the process and its readers are done.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    stdout_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stdout_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
    stderr_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stderr_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
    sigint_timeout: Duration,
    sigterm_timeout: Duration,
}

impl ProcessInvoker {
    /// Create a new `ProcessInvoker` with the given trace writer.
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            stdout_tx,
            stdout_rx: Some(stdout_rx),
            stderr_tx,
            stderr_rx: Some(stderr_rx),
            sigint_timeout: DEFAULT_SIGINT_TIMEOUT,
            sigterm_timeout: DEFAULT_SIGTERM_TIMEOUT,
        }
    }

    /// Override the grace periods granted after SIGINT and after SIGTERM.
    pub fn with_signal_timeouts(mut self, sigint: Duration, sigterm: Duration) -> Self {
        self.sigint_timeout = sigint;
        self.sigterm_timeout = sigterm;
        self
    }

    /// Take the stdout receiver. Can only be called once; subsequent calls return `None`.
    pub fn take_stdout_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stdout_rx.take()
    }

    /// Take the stderr receiver. Can only be called once; subsequent calls return `None`.
    pub fn take_stderr_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stderr_rx.take()
    }

    /// Execute a process and wait for it to exit or for cancellation.
    ///
    /// # Arguments
    /// * `working_directory` - The working directory for the process.
    /// * `file_name` - The executable to run.
    /// * `arguments` - Command-line arguments, passed through verbatim.
    /// * `environment` - Optional environment variable overrides.
    /// * `require_exit_code_zero` - If true, returns an error on non-zero exit.
    /// * `kill_process_on_cancel` - If true, skip graceful shutdown and SIGKILL immediately.
    /// * `cancellation_token` - Token that stops the process.
    ///
    /// A cancelled process yields `ProcessOutcome::Cancelled` rather than an error,
    /// whatever its exit code.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        self,
        working_directory: &Path,
        file_name: &Path,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        require_exit_code_zero: bool,
        kill_process_on_cancel: bool,
        cancellation_token: CancellationToken,
    ) -> Result<ProcessOutcome> {
        let display_args = arguments.join(" ");

        self.trace.info("Starting process:");
        self.trace
            .info(&format!("  File name: '{}'", file_name.display()));
        self.trace.info(&format!("  Arguments: '{display_args}'"));
        self.trace.info(&format!(
            "  Working directory: '{}'",
            working_directory.display()
        ));
        self.trace.verbose(&format!(
            "  Require exit code zero: '{require_exit_code_zero}'"
        ));
        self.trace.verbose(&format!(
            "  Force kill process on cancellation: '{kill_process_on_cancel}'"
        ));

        let mut cmd = Command::new(file_name);
        cmd.args(arguments);

        if working_directory.is_dir() {
            cmd.current_dir(working_directory);
        }

        if let Some(env) = environment {
            cmd.envs(env);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to start process '{}' with arguments '{display_args}'",
                file_name.display()
            )
        })?;

        let pid = child.id().unwrap_or(0);
        self.trace.info(&format!(
            "Process started with process id {pid}, waiting for process exit."
        ));

        let stdout_task = spawn_line_reader(
            child.stdout.take(),
            self.stdout_tx.clone(),
            self.trace.clone(),
            "STDOUT",
        );
        let stderr_task = spawn_line_reader(
            child.stderr.take(),
            self.stderr_tx.clone(),
            self.trace.clone(),
            "STDERR",
        );

        let outcome = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for process")?;
                ProcessOutcome::Exited(exit_code_of(&status))
            }
            _ = cancellation_token.cancelled() => {
                self.trace.info("Cancellation requested.");
                ProcessOutcome::Cancelled(
                    self.cancel_and_kill_process(&mut child, kill_process_on_cancel).await,
                )
            }
        };

        self.finish_reader(stdout_task, "STDOUT").await;
        self.finish_reader(stderr_task, "STDERR").await;

        let elapsed = start.elapsed();
        self.trace.info(&format!(
            "Finished process {pid} with exit code {}, and elapsed time {elapsed:.2?}.",
            outcome.exit_code()
        ));

        if let ProcessOutcome::Exited(exit_code) = outcome {
            if exit_code != 0 && require_exit_code_zero {
                return Err(ProcessExitCodeError {
                    exit_code,
                    file_name: file_name.display().to_string(),
                    arguments: display_args,
                }
                .into());
            }
        }

        Ok(outcome)
    }

    /// Wait for a stream reader to finish, giving up after `STREAM_DRAIN_TIMEOUT`.
    async fn finish_reader(&self, mut task: JoinHandle<()>, stream: &str) {
        tokio::select! {
            _ = &mut task => {}
            _ = tokio::time::sleep(STREAM_DRAIN_TIMEOUT) => {
                self.trace.warning(&format!(
                    "{stream} is still open {:.1}s after process exit; abandoning the reader.",
                    STREAM_DRAIN_TIMEOUT.as_secs_f64()
                ));
                task.abort();
            }
        }
    }

    /// Attempt graceful cancellation: SIGINT → SIGTERM → SIGKILL.
    /// If `kill_immediately` is true, skip signals and go straight to kill.
    async fn cancel_and_kill_process(
        &self,
        child: &mut tokio::process::Child,
        kill_immediately: bool,
    ) -> i32 {
        if !kill_immediately {
            if self
                .send_signal_and_wait(child, Signal::Int, self.sigint_timeout)
                .await
            {
                self.trace
                    .info("Process cancelled successfully through SIGINT.");
                return wait_exit_code(child).await;
            }

            if self
                .send_signal_and_wait(child, Signal::Term, self.sigterm_timeout)
                .await
            {
                self.trace
                    .info("Process terminated successfully through SIGTERM.");
                return wait_exit_code(child).await;
            }
        }

        self.trace.info(
            "Kill entire process tree since both cancel and terminate signals have been ignored.",
        );
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        let _ = child.kill().await;
        wait_exit_code(child).await
    }

    /// Send a signal to the child's process group and wait up to `timeout` for it to exit.
    /// Returns `true` if the process exited within the timeout.
    #[cfg(unix)]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: Signal,
        timeout: Duration,
    ) -> bool {
        let pid = match child.id() {
            Some(id) => id,
            // Already reaped.
            None => return true,
        };

        let sig = match signal {
            Signal::Int => nix::sys::signal::Signal::SIGINT,
            Signal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        self.trace
            .info(&format!("Sending {sig:?} to process group {pid}."));

        if nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
            self.trace.info(&format!(
                "{sig:?} signal failed to send to process group {pid}."
            ));
            return false;
        }

        self.trace.info(&format!(
            "Waiting for process exit or {:.1}s after {sig:?} signal.",
            timeout.as_secs_f64()
        ));

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn send_signal_and_wait(
        &self,
        child: &mut tokio::process::Child,
        _signal: Signal,
        timeout: Duration,
    ) -> bool {
        // No POSIX signals: give the process the grace period, then let the
        // caller force kill it.
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}

fn spawn_line_reader<R>(
    stream: Option<R>,
    tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    trace: Arc<dyn TraceWriter>,
    name: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Some(stream) = stream {
            // Invalid UTF-8 is replaced, never ends the stream.
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let data = String::from_utf8_lossy(trim_line_ending(&buf)).into_owned();
                        let _ = tx.send(ProcessDataReceivedEventArgs { data });
                    }
                    Err(e) => {
                        trace.warning(&format!("{name} read failed: {e}"));
                        break;
                    }
                }
            }
        }
        trace.verbose(&format!("{name} stream read finished."));
    })
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn wait_exit_code(child: &mut tokio::process::Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| exit_code_of(&s))
        .unwrap_or(-1)
}

/// Exit code of a finished process; signal deaths map to `128 + signal`.
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}
