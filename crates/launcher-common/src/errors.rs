// Error taxonomy of the launcher.
//
// Invocation-level errors abort before any runner task is dispatched; the
// rest are fatal only to the runner task that raised them.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    /// Neither a registration token nor an access credential is configured.
    #[error("runner '{runner}' has neither RUNNER_TOKEN nor ACCESS_TOKEN set")]
    MissingCredential { runner: String },

    /// `RUNNER_WORKDIR` is empty or cannot be resolved.
    #[error("runner '{runner}' has an unusable work directory: {reason}")]
    WorkDir { runner: String, reason: String },

    /// The launch configuration file cannot be read or parsed.
    #[error("failed to load config file {}: {reason}", path.display())]
    ConfigFile { path: PathBuf, reason: String },

    #[error("cannot derive owner and repository from '{url}'")]
    InvalidRepoUrl { url: String },

    #[error("failed to obtain a registration token: {reason}")]
    TokenIssuanceFailed { reason: String },

    #[error("failed to provision {}: {reason}", work_dir.display())]
    ProvisioningFailed { work_dir: PathBuf, reason: String },

    #[error("configuration of runner '{runner}' failed with exit code {exit_code}")]
    ConfigurationFailed { runner: String, exit_code: i32 },

    #[error("runner '{runner}' exited with code {exit_code}")]
    RunFailed { runner: String, exit_code: i32 },
}

impl LauncherError {
    /// Whether this error aborts the whole invocation rather than one runner.
    pub fn is_invocation_level(&self) -> bool {
        matches!(
            self,
            LauncherError::MissingCredential { .. }
                | LauncherError::WorkDir { .. }
                | LauncherError::ConfigFile { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_runner() {
        let err = LauncherError::MissingCredential {
            runner: "ci-1".into(),
        };
        assert!(err.to_string().contains("ci-1"));
        assert!(err.is_invocation_level());
    }

    #[test]
    fn task_errors_are_not_invocation_level() {
        let err = LauncherError::ProvisioningFailed {
            work_dir: PathBuf::from("/srv/runner"),
            reason: "404".into(),
        };
        assert!(err.to_string().contains("/srv/runner"));
        assert!(!err.is_invocation_level());
    }
}
