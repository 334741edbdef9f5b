// Launcher-wide settings, built once from the command line.

use crate::constants::{self, Architecture};
use launcher_sdk::process_invoker::{DEFAULT_SIGINT_TIMEOUT, DEFAULT_SIGTERM_TIMEOUT};
use std::time::Duration;

/// Grace periods granted to a child process on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Wait after SIGINT before sending SIGTERM.
    pub interrupt_timeout: Duration,
    /// Wait after SIGTERM before sending SIGKILL.
    pub terminate_timeout: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            interrupt_timeout: DEFAULT_SIGINT_TIMEOUT,
            terminate_timeout: DEFAULT_SIGTERM_TIMEOUT,
        }
    }
}

/// Immutable settings shared by every runner task of one invocation.
#[derive(Debug, Clone)]
pub struct LauncherSettings {
    pub runner_version: String,
    pub runner_arch: Architecture,
    /// Deregister existing runners with the same name before registering.
    pub remove_existing: bool,
    /// Treat a failed configure step as fatal to the runner.
    pub force_reconfigure: bool,
    /// Run `bin/installdependencies.sh` after extracting a fresh archive.
    pub install_dependencies: bool,
    /// Base URL runner archives are downloaded from.
    pub download_base: String,
    /// REST API root; `https://api.github.com` or `{server}/api/v3`.
    pub api_url: String,
    pub shutdown: ShutdownPolicy,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            runner_version: constants::release::DEFAULT_VERSION.to_string(),
            runner_arch: Architecture::default(),
            remove_existing: false,
            force_reconfigure: false,
            install_dependencies: false,
            download_base: constants::release::DEFAULT_DOWNLOAD_BASE.to_string(),
            api_url: constants::api::DEFAULT_API_URL.to_string(),
            shutdown: ShutdownPolicy::default(),
        }
    }
}

impl LauncherSettings {
    /// File name of the runner archive for the configured version and architecture.
    pub fn archive_name(&self) -> String {
        format!(
            "actions-runner-{}-{}-{}.tar.gz",
            constants::release::PLATFORM,
            self.runner_arch,
            self.runner_version
        )
    }

    /// Download URL of the runner archive:
    /// `{base}/v{version}/actions-runner-linux-{arch}-{version}.tar.gz`.
    pub fn archive_url(&self) -> String {
        format!(
            "{}/v{}/{}",
            self.download_base.trim_end_matches('/'),
            self.runner_version,
            self.archive_name()
        )
    }
}
