// Command-line interface of the launcher. Every flag can also be set through
// the environment variable named next to it.

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use launcher_common::constants::{self, Architecture};
use launcher_common::{LauncherSettings, ShutdownPolicy};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::fleet::LaunchMode;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "github-actions-runner-launcher",
    version,
    about = "Provision, configure and supervise self-hosted GitHub Actions runners"
)]
pub struct CommandSettings {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub options: LauncherOptions,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Provision and configure every runner, then exit.
    Install,
    /// Provision, configure and run every runner until shutdown.
    Run,
}

#[derive(Args, Debug, Clone)]
pub struct LauncherOptions {
    /// Launch file declaring the runners.
    #[arg(long, env = "CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Runner host architecture (x64, arm, arm64).
    #[arg(long, env = "RUNNER_ARCH", default_value = "x64", global = true)]
    pub runner_arch: Architecture,

    /// Runner release to install.
    #[arg(
        long,
        env = "RUNNER_VERSION",
        default_value = constants::release::DEFAULT_VERSION,
        global = true
    )]
    pub runner_version: String,

    /// Deregister runners with the same name before registering.
    #[arg(long, env = "REMOVE_EXISTING", value_parser = BoolishValueParser::new(), global = true)]
    pub remove_existing: bool,

    /// Fail a runner when its configure step fails.
    #[arg(long, env = "FORCE_RECONFIGURE", value_parser = BoolishValueParser::new(), global = true)]
    pub force_reconfigure: bool,

    /// Run bin/installdependencies.sh after extracting a runner archive.
    #[arg(long, env = "INSTALL_DEPENDENCIES", value_parser = BoolishValueParser::new(), global = true)]
    pub install_dependencies: bool,

    /// REST API root (https://<host>/api/v3 for GitHub Enterprise Server).
    #[arg(
        long,
        env = "GITHUB_API_URL",
        default_value = constants::api::DEFAULT_API_URL,
        global = true
    )]
    pub api_url: Url,

    /// Base URL runner archives are downloaded from.
    #[arg(
        long,
        env = "RUNNER_DOWNLOAD_URL",
        default_value = constants::release::DEFAULT_DOWNLOAD_BASE,
        global = true
    )]
    pub download_url: Url,

    /// Grace period after SIGINT before a runner is sent SIGTERM.
    #[arg(long, default_value_t = 7500, global = true)]
    pub interrupt_timeout_ms: u64,

    /// Grace period after SIGTERM before a runner is killed.
    #[arg(long, default_value_t = 2500, global = true)]
    pub terminate_timeout_ms: u64,

    /// Log level (error, warn, info, debug, trace). RUST_LOG takes precedence.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log: String,
}

impl CommandSettings {
    pub fn mode(&self) -> LaunchMode {
        match self.command {
            Command::Install => LaunchMode::Install,
            Command::Run => LaunchMode::Run,
        }
    }

    pub fn settings(&self) -> LauncherSettings {
        let o = &self.options;
        LauncherSettings {
            runner_version: o.runner_version.trim().to_string(),
            runner_arch: o.runner_arch,
            remove_existing: o.remove_existing,
            force_reconfigure: o.force_reconfigure,
            install_dependencies: o.install_dependencies,
            download_base: o.download_url.as_str().trim_end_matches('/').to_string(),
            api_url: o.api_url.as_str().trim_end_matches('/').to_string(),
            shutdown: ShutdownPolicy {
                interrupt_timeout: Duration::from_millis(o.interrupt_timeout_ms),
                terminate_timeout: Duration::from_millis(o.terminate_timeout_ms),
            },
        }
    }
}
