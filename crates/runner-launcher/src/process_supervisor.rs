// ProcessSupervisor: runs a configured runner's run.sh until it exits or the
// launcher shuts down, streaming its output into the launcher log.

use anyhow::Result;
use launcher_common::constants::path;
use launcher_common::{LauncherContext, LauncherError, Tracing};
use launcher_sdk::{ProcessInvoker, ProcessOutcome, TraceWriter};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a supervised runner stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// run.sh exited with code 0 on its own.
    Exited,
    /// Shutdown was requested and the runner was stopped.
    Stopped { exit_code: i32 },
}

pub struct ProcessSupervisor {
    context: Arc<LauncherContext>,
    trace: Tracing,
}

impl ProcessSupervisor {
    pub fn new(context: Arc<LauncherContext>) -> Self {
        let trace = context.get_trace("ProcessSupervisor");
        Self { context, trace }
    }

    /// Run `run.sh` in `work_dir` and block until it exits or `cancellation_token`
    /// fires. Stdout lines are logged at info, stderr lines at error, both tagged
    /// with the runner; every line is logged before this returns.
    ///
    /// A non-zero exit without cancellation is `LauncherError::RunFailed`.
    pub async fn run_runner(
        &self,
        runner: &str,
        work_dir: &Path,
        cancellation_token: CancellationToken,
    ) -> Result<RunExit> {
        let trace = self.trace.for_runner(runner);
        let script = work_dir.join(path::RUN_SCRIPT);
        if !script.is_file() {
            return Err(LauncherError::ProvisioningFailed {
                work_dir: work_dir.to_path_buf(),
                reason: format!("{} is missing", path::RUN_SCRIPT),
            }
            .into());
        }

        let shutdown = self.context.settings().shutdown;
        let mut invoker = ProcessInvoker::new(Arc::new(trace.clone()))
            .with_signal_timeouts(shutdown.interrupt_timeout, shutdown.terminate_timeout);

        let stdout_pump = invoker.take_stdout_receiver().map(|mut rx| {
            let trace = trace.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    trace.info(&event.data);
                }
            })
        });
        let stderr_pump = invoker.take_stderr_receiver().map(|mut rx| {
            let trace = trace.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    trace.error(&event.data);
                }
            })
        });

        trace.info("Starting runner");
        let outcome = invoker
            .execute(
                work_dir,
                &script,
                &[],
                None,
                false,
                false,
                cancellation_token.clone(),
            )
            .await;

        // The invoker has been consumed, so the channels close and the pumps finish.
        for pump in [stdout_pump, stderr_pump].into_iter().flatten() {
            if let Err(e) = pump.await {
                trace.warning(&format!("Output pump ended abnormally: {e}"));
            }
        }

        match outcome? {
            ProcessOutcome::Cancelled(exit_code) => {
                trace.info(&format!("Runner stopped (exit code {exit_code})"));
                Ok(RunExit::Stopped { exit_code })
            }
            // A child that dies from the group signal can win the race against
            // the cancellation branch.
            ProcessOutcome::Exited(exit_code) if cancellation_token.is_cancelled() => {
                trace.info(&format!("Runner stopped (exit code {exit_code})"));
                Ok(RunExit::Stopped { exit_code })
            }
            ProcessOutcome::Exited(0) => {
                trace.info("Runner exited");
                Ok(RunExit::Exited)
            }
            ProcessOutcome::Exited(exit_code) => Err(LauncherError::RunFailed {
                runner: runner.to_string(),
                exit_code,
            }
            .into()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{test_context, write_executable, RunnerScripts};
    use launcher_common::{LauncherSettings, ShutdownPolicy};
    use launcher_sdk::trace::TraceLevel;
    use std::time::Duration;

    fn fast_shutdown() -> LauncherSettings {
        LauncherSettings {
            shutdown: ShutdownPolicy {
                interrupt_timeout: Duration::from_secs(2),
                terminate_timeout: Duration::from_secs(1),
            },
            ..LauncherSettings::default()
        }
    }

    #[tokio::test]
    async fn streams_output_with_runner_identity() {
        let (context, sink) = test_context(fast_shutdown());
        let dir = tempfile::tempdir().unwrap();
        write_executable(&dir.path().join("run.sh"), "#!/bin/sh\necho 'job done'\necho 'warn!' >&2\n");

        let exit = ProcessSupervisor::new(context)
            .run_runner("ci-1", dir.path(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(exit, RunExit::Exited);
        assert!(sink.contains(TraceLevel::Info, "[ci-1] job done"));
        assert!(sink.contains(TraceLevel::Error, "[ci-1] warn!"));
    }

    #[tokio::test]
    async fn invalid_utf8_output_keeps_the_runner_alive() {
        let (context, sink) = test_context(fast_shutdown());
        let dir = tempfile::tempdir().unwrap();
        write_executable(
            &dir.path().join("run.sh"),
            "#!/bin/sh\necho before\nprintf 'bad \\377 byte\\n'\necho after\ni=0\nwhile [ $i -lt 2000 ]; do echo line$i; i=$((i+1)); done\n",
        );

        let exit = ProcessSupervisor::new(context)
            .run_runner("ci-1", dir.path(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(exit, RunExit::Exited);
        assert!(sink.contains(TraceLevel::Info, "[ci-1] before"));
        assert!(sink.contains(TraceLevel::Info, "[ci-1] bad \u{FFFD} byte"));
        assert!(sink.contains(TraceLevel::Info, "[ci-1] after"));
        assert!(sink.contains(TraceLevel::Info, "[ci-1] line1999"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_run_failure() {
        let (context, _) = test_context(fast_shutdown());
        let dir = tempfile::tempdir().unwrap();
        write_executable(&dir.path().join("run.sh"), "#!/bin/sh\nexit 5\n");

        let err = ProcessSupervisor::new(context)
            .run_runner("ci-1", dir.path(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<LauncherError>(),
            Some(LauncherError::RunFailed { exit_code: 5, .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_the_runner() {
        let (context, sink) = test_context(fast_shutdown());
        let dir = tempfile::tempdir().unwrap();
        RunnerScripts::default().install(dir.path());
        let token = CancellationToken::new();

        let supervisor = ProcessSupervisor::new(context);
        let cancel = token.clone();
        let started = dir.path().join("run.started");
        let stopper = tokio::spawn(async move {
            while !started.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            cancel.cancel();
        });

        let exit = tokio::time::timeout(
            Duration::from_secs(10),
            supervisor.run_runner("ci-1", dir.path(), token),
        )
        .await
        .expect("runner should stop after cancellation")
        .unwrap();
        stopper.await.unwrap();

        assert!(matches!(exit, RunExit::Stopped { .. }));
        assert!(sink.contains(TraceLevel::Info, "[ci-1] listening for jobs"));
    }

    #[tokio::test]
    async fn missing_run_script_is_rejected() {
        let (context, _) = test_context(fast_shutdown());
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessSupervisor::new(context)
            .run_runner("ci-1", dir.path(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LauncherError>(),
            Some(LauncherError::ProvisioningFailed { .. })
        ));
    }
}
