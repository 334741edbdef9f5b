// Configurator: registers an installed runner by invoking its config.sh.

use anyhow::Result;
use launcher_common::constants::{command_line, path};
use launcher_common::{LauncherContext, LauncherError, Tracing};
use launcher_sdk::{ProcessInvoker, ProcessOutcome, TraceWriter};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Everything `config.sh` needs to register one runner.
#[derive(Debug, Clone)]
pub struct ConfigureRequest<'a> {
    pub runner: &'a str,
    /// Repository or organization URL passed as `--url`.
    pub url: &'a str,
    pub token: &'a str,
    pub work_dir: &'a Path,
    pub labels: &'a [String],
}

impl ConfigureRequest<'_> {
    /// `--url --token --name --work [--labels] --unattended --replace`.
    /// `--labels` is left out when there are none.
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec![
            command_line::args::URL.to_string(),
            self.url.to_string(),
            command_line::args::TOKEN.to_string(),
            self.token.to_string(),
            command_line::args::NAME.to_string(),
            self.runner.to_string(),
            command_line::args::WORK.to_string(),
            self.work_dir.display().to_string(),
        ];
        if !self.labels.is_empty() {
            args.push(command_line::args::LABELS.to_string());
            args.push(self.labels.join(","));
        }
        args.push(command_line::flags::UNATTENDED.to_string());
        args.push(command_line::flags::REPLACE.to_string());
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureOutcome {
    Configured,
    /// config.sh failed but the non-strict policy lets the runner continue.
    Degraded { warning: String },
    Cancelled,
}

pub struct Configurator {
    context: Arc<LauncherContext>,
    trace: Tracing,
}

impl Configurator {
    pub fn new(context: Arc<LauncherContext>) -> Self {
        let trace = context.get_trace("Configurator");
        Self { context, trace }
    }

    /// Run `config.sh` for the request.
    ///
    /// A non-zero exit is `LauncherError::ConfigurationFailed` when
    /// force-reconfigure is set, and a `Degraded` outcome otherwise.
    pub async fn configure(
        &self,
        request: &ConfigureRequest<'_>,
        cancellation_token: CancellationToken,
    ) -> Result<ConfigureOutcome> {
        let trace = self.trace.for_runner(request.runner);
        let script = config_script(request.work_dir)?;
        self.context.secret_masker().add_value(request.token);

        trace.info(&format!("Configuring runner in {}", request.work_dir.display()));
        let (outcome, output) = run_collecting(
            &trace,
            request.work_dir,
            &script,
            &request.arguments(),
            cancellation_token,
        )
        .await;

        let exit_code = match outcome {
            Ok(ProcessOutcome::Exited(0)) => {
                trace.info("Runner configured");
                return Ok(ConfigureOutcome::Configured);
            }
            Ok(ProcessOutcome::Cancelled(_)) => return Ok(ConfigureOutcome::Cancelled),
            Ok(ProcessOutcome::Exited(code)) => code,
            Err(e) => {
                trace.error(&format!("Failed to start {}: {e:#}", script.display()));
                -1
            }
        };

        if self.context.settings().force_reconfigure {
            trace.error(&format!("{} exited with code {exit_code}", script.display()));
            for line in &output {
                trace.error(line);
            }
            return Err(LauncherError::ConfigurationFailed {
                runner: request.runner.to_string(),
                exit_code,
            }
            .into());
        }

        for line in &output {
            trace.verbose(line);
        }
        let warning = format!(
            "config.sh exited with code {exit_code}; continuing with the existing configuration"
        );
        trace.warning(&warning);
        Ok(ConfigureOutcome::Degraded { warning })
    }

    /// Run `config.sh remove --token <remove_token>` against an existing install.
    pub async fn remove_local_registration(
        &self,
        runner: &str,
        work_dir: &Path,
        remove_token: &str,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        let trace = self.trace.for_runner(runner);
        let script = config_script(work_dir)?;
        self.context.secret_masker().add_value(remove_token);

        trace.info("Removing local runner registration");
        let args = vec![
            command_line::commands::REMOVE.to_string(),
            command_line::args::TOKEN.to_string(),
            remove_token.to_string(),
        ];
        let (outcome, output) =
            run_collecting(&trace, work_dir, &script, &args, cancellation_token).await;
        match outcome? {
            ProcessOutcome::Exited(0) | ProcessOutcome::Cancelled(_) => Ok(()),
            ProcessOutcome::Exited(code) => {
                for line in &output {
                    trace.verbose(line);
                }
                anyhow::bail!("config.sh remove exited with code {code}")
            }
        }
    }
}

fn config_script(work_dir: &Path) -> Result<std::path::PathBuf> {
    let script = work_dir.join(path::CONFIG_SCRIPT);
    if !script.is_file() {
        return Err(LauncherError::ProvisioningFailed {
            work_dir: work_dir.to_path_buf(),
            reason: format!("{} is missing", path::CONFIG_SCRIPT),
        }
        .into());
    }
    Ok(script)
}

/// Run a program to completion and return its stdout followed by its stderr.
async fn run_collecting(
    trace: &Tracing,
    work_dir: &Path,
    program: &Path,
    args: &[String],
    cancellation_token: CancellationToken,
) -> (Result<ProcessOutcome>, Vec<String>) {
    let mut invoker = ProcessInvoker::new(Arc::new(trace.clone()));
    let stdout = invoker.take_stdout_receiver();
    let stderr = invoker.take_stderr_receiver();

    let outcome = invoker
        .execute(work_dir, program, args, None, false, false, cancellation_token)
        .await;

    // The invoker is gone, so both channels are closed once drained.
    let mut output = drain(stdout).await;
    output.extend(drain(stderr).await);
    (outcome, output)
}

async fn drain(
    receiver: Option<UnboundedReceiver<launcher_sdk::ProcessDataReceivedEventArgs>>,
) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(mut receiver) = receiver {
        while let Some(event) = receiver.recv().await {
            lines.push(event.data);
        }
    }
    lines
}
