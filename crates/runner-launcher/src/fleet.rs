// Fleet orchestration: validates the launch file, then drives every declared
// runner through token → provision → configure → run on its own task.

use crate::configurator::{ConfigureOutcome, ConfigureRequest, Configurator};
use crate::credential_broker::{CredentialBroker, TokenRequest};
use crate::github_api::RunnerScope;
use crate::process_supervisor::{ProcessSupervisor, RunExit};
use crate::provisioner::Provisioner;
use anyhow::Result;
use futures::future::join_all;
use launcher_common::constants::return_code;
use launcher_common::{LaunchConfig, LauncherContext, LauncherError, RunnerConfig, Tracing};
use launcher_sdk::TraceWriter;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Provision and configure only.
    Install,
    /// Provision, configure and keep the runners running.
    Run,
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchMode::Install => write!(f, "install"),
            LaunchMode::Run => write!(f, "run"),
        }
    }
}

/// Lifecycle position of one runner.
///
/// `Pending → TokenResolved → Configured → Running → Stopped`, with `Failed`
/// reachable from every non-terminal state. An install ends in `Configured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Pending,
    TokenResolved,
    Configured,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Pending => "pending",
            RunnerState::TokenResolved => "token resolved",
            RunnerState::Configured => "configured",
            RunnerState::Running => "running",
            RunnerState::Stopped => "stopped",
            RunnerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOutcome {
    pub name: String,
    pub state: RunnerState,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl RunnerOutcome {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: RunnerState::Pending,
            warnings: Vec::new(),
            error: None,
        }
    }

    fn failed(name: &str, error: String) -> Self {
        Self {
            state: RunnerState::Failed,
            error: Some(error),
            ..Self::new(name)
        }
    }
}

/// Final states of every dispatched runner, in launch-file order.
#[derive(Debug, Clone, Default)]
pub struct FleetReport {
    pub outcomes: Vec<RunnerOutcome>,
}

impl FleetReport {
    pub fn outcome(&self, name: &str) -> Option<&RunnerOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RunnerOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state == RunnerState::Failed)
    }

    /// `RUNNER_FAILURES` when any runner failed, `SUCCESS` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failures().next().is_some() {
            return_code::RUNNER_FAILURES
        } else {
            return_code::SUCCESS
        }
    }
}

#[derive(Clone)]
enum Credential {
    /// `RUNNER_TOKEN`, used as the registration token as-is.
    RegistrationToken(String),
    /// `ACCESS_TOKEN`, exchanged for a registration token.
    AccessToken(String),
}

/// A validated runner declaration, ready for dispatch.
#[derive(Clone)]
pub struct RunnerPlan {
    pub key: String,
    pub name: String,
    pub config: RunnerConfig,
    pub work_dir: PathBuf,
    credential: Credential,
}

impl RunnerPlan {
    pub fn uses_static_token(&self) -> bool {
        matches!(self.credential, Credential::RegistrationToken(_))
    }
}

impl fmt::Debug for RunnerPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerPlan")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("work_dir", &self.work_dir)
            .field("static_token", &self.uses_static_token())
            .finish()
    }
}

/// The per-runner stages, shared by every runner task.
struct Lifecycle {
    broker: CredentialBroker,
    provisioner: Provisioner,
    configurator: Configurator,
    supervisor: ProcessSupervisor,
    trace: Tracing,
}

pub struct Launcher {
    context: Arc<LauncherContext>,
    config: LaunchConfig,
    lifecycle: Arc<Lifecycle>,
    trace: Tracing,
}

impl Launcher {
    pub fn new(context: Arc<LauncherContext>, config: LaunchConfig) -> Result<Self> {
        let broker = CredentialBroker::new(context.clone());
        let provisioner = Provisioner::new(context.clone())?;
        Ok(Self::with_stages(context, config, broker, provisioner))
    }

    pub fn with_stages(
        context: Arc<LauncherContext>,
        config: LaunchConfig,
        broker: CredentialBroker,
        provisioner: Provisioner,
    ) -> Self {
        let lifecycle = Lifecycle {
            broker,
            provisioner,
            configurator: Configurator::new(context.clone()),
            supervisor: ProcessSupervisor::new(context.clone()),
            trace: context.get_trace("Runner"),
        };
        Self {
            trace: context.get_trace("Launcher"),
            context,
            config,
            lifecycle: Arc::new(lifecycle),
        }
    }

    /// Validate every declaration before anything is dispatched.
    ///
    /// Credentials from the file are registered with the secret masker here.
    /// A runner with neither `RUNNER_TOKEN` nor `ACCESS_TOKEN`, or with an
    /// unusable workdir, fails the whole invocation.
    pub fn plan(&self) -> Result<Vec<RunnerPlan>, LauncherError> {
        let masker = self.context.secret_masker();
        masker.add_values(self.config.credentials());
        self.trace
            .verbose(&format!("Masking {} secret(s)", masker.secret_count()));

        match serde_yaml::to_string(&self.config) {
            Ok(dump) => self.trace.verbose(&format!("Launch configuration:\n{dump}")),
            Err(e) => self.trace.verbose(&format!("Cannot render launch configuration: {e}")),
        }

        let mut plans = Vec::with_capacity(self.config.services.len());
        for (key, config) in &self.config.services {
            let name = config.effective_name(key).to_string();
            let credential = match (config.static_token(), config.access_token()) {
                (Some(token), _) => Credential::RegistrationToken(token.to_string()),
                (None, Some(access_token)) => Credential::AccessToken(access_token.to_string()),
                (None, None) => return Err(LauncherError::MissingCredential { runner: name }),
            };
            let work_dir = config.resolve_work_dir(&name, self.config.config_dir())?;
            plans.push(RunnerPlan {
                key: key.clone(),
                name,
                config: config.clone(),
                work_dir,
                credential,
            });
        }
        Ok(plans)
    }

    /// Launch every runner and wait for all of them to finish.
    ///
    /// Returns `Err` only for invocation-level problems; per-runner failures
    /// are reported in the `FleetReport`.
    pub async fn run(&self, mode: LaunchMode) -> Result<FleetReport> {
        let plans = self.plan()?;
        if plans.is_empty() {
            self.trace.warning("No runners declared in the launch file");
            return Ok(FleetReport::default());
        }
        self.trace
            .info(&format!("Launching {} runner(s) in {mode} mode", plans.len()));

        let shutdown = self.context.shutdown_token();
        let mut names = Vec::with_capacity(plans.len());
        let mut tasks = Vec::with_capacity(plans.len());
        for plan in plans {
            names.push(plan.name.clone());
            let lifecycle = self.lifecycle.clone();
            let cancel = shutdown.child_token();
            tasks.push(tokio::spawn(async move {
                lifecycle.launch(plan, mode, cancel).await
            }));
        }

        let outcomes = join_all(tasks)
            .await
            .into_iter()
            .zip(names)
            .map(|(joined, name)| match joined {
                Ok(outcome) => outcome,
                Err(e) => RunnerOutcome::failed(&name, format!("runner task aborted: {e}")),
            })
            .collect();

        let report = FleetReport { outcomes };
        self.log_summary(&report);
        Ok(report)
    }

    fn log_summary(&self, report: &FleetReport) {
        for outcome in &report.outcomes {
            let trace = self.trace.for_runner(&outcome.name);
            match &outcome.error {
                Some(error) => trace.error(&format!("Finished {}: {error}", outcome.state)),
                None if outcome.warnings.is_empty() => {
                    trace.info(&format!("Finished {}", outcome.state))
                }
                None => trace.warning(&format!(
                    "Finished {} with {} warning(s)",
                    outcome.state,
                    outcome.warnings.len()
                )),
            }
        }
    }
}

impl Lifecycle {
    async fn launch(&self, plan: RunnerPlan, mode: LaunchMode, cancel: CancellationToken) -> RunnerOutcome {
        let trace = self.trace.for_runner(&plan.name);
        let mut outcome = RunnerOutcome::new(&plan.name);

        if let Err(e) = self.drive(&trace, &plan, mode, &cancel, &mut outcome).await {
            if cancel.is_cancelled() {
                trace.info(&format!("Interrupted while {}: {e:#}", outcome.state));
                outcome.state = RunnerState::Stopped;
            } else {
                trace.error_chain(&e);
                outcome.state = RunnerState::Failed;
                outcome.error = Some(format!("{e:#}"));
            }
        }
        outcome
    }

    async fn drive(
        &self,
        trace: &Tracing,
        plan: &RunnerPlan,
        mode: LaunchMode,
        cancel: &CancellationToken,
        outcome: &mut RunnerOutcome,
    ) -> Result<()> {
        let token = match &plan.credential {
            Credential::RegistrationToken(token) => {
                trace.verbose("Using the configured registration token");
                token.clone()
            }
            Credential::AccessToken(access_token) => {
                let request = TokenRequest {
                    runner: &plan.name,
                    config: &plan.config,
                    work_dir: &plan.work_dir,
                    access_token,
                };
                let grant = tokio::select! {
                    grant = self.broker.obtain_runner_token(request, cancel.clone()) => grant?,
                    _ = cancel.cancelled() => {
                        trace.info("Shutdown requested while obtaining a registration token");
                        outcome.state = RunnerState::Stopped;
                        return Ok(());
                    }
                };
                outcome.warnings.extend(grant.warnings);
                grant.token.token
            }
        };
        outcome.state = RunnerState::TokenResolved;
        if stop_requested(cancel, outcome) {
            return Ok(());
        }

        let report = self
            .provisioner
            .ensure_installed(&plan.name, &plan.work_dir, cancel.clone())
            .await?;
        outcome.warnings.extend(report.warnings);
        if stop_requested(cancel, outcome) {
            return Ok(());
        }

        let url = configure_url(&plan.config)?;
        let labels = plan.config.labels();
        let request = ConfigureRequest {
            runner: &plan.name,
            url: &url,
            token: &token,
            work_dir: &plan.work_dir,
            labels: &labels,
        };
        match self.configurator.configure(&request, cancel.clone()).await? {
            ConfigureOutcome::Configured => {}
            ConfigureOutcome::Degraded { warning } => outcome.warnings.push(warning),
            ConfigureOutcome::Cancelled => {
                outcome.state = RunnerState::Stopped;
                return Ok(());
            }
        }
        outcome.state = RunnerState::Configured;

        if mode == LaunchMode::Install {
            trace.info("Runner installed and configured");
            return Ok(());
        }
        if stop_requested(cancel, outcome) {
            return Ok(());
        }

        outcome.state = RunnerState::Running;
        match self
            .supervisor
            .run_runner(&plan.name, &plan.work_dir, cancel.clone())
            .await?
        {
            RunExit::Exited => trace.info("Runner exited on its own"),
            RunExit::Stopped { exit_code } => {
                trace.verbose(&format!("Runner stopped with exit code {exit_code}"))
            }
        }
        outcome.state = RunnerState::Stopped;
        Ok(())
    }
}

fn stop_requested(cancel: &CancellationToken, outcome: &mut RunnerOutcome) -> bool {
    if cancel.is_cancelled() {
        outcome.state = RunnerState::Stopped;
    }
    cancel.is_cancelled()
}

/// URL passed to `config.sh --url`: the organization URL for org runners,
/// `REPO_URL` otherwise.
fn configure_url(config: &RunnerConfig) -> Result<String, LauncherError> {
    let repo_url = config.environment.repo_url.trim();
    if config.is_org_runner() {
        RunnerScope::for_runner(config)?.registration_url(repo_url)
    } else {
        Ok(repo_url.trim_end_matches('/').to_string())
    }
}
