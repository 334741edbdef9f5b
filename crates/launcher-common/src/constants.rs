// Constants shared by every launcher component: architectures, well-known
// file names inside a runner installation, remote endpoints and exit codes.

use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// CPU architecture of the runner archive to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Architecture {
    #[default]
    X64,
    Arm,
    Arm64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X64 => write!(f, "x64"),
            Architecture::Arm => write!(f, "arm"),
            Architecture::Arm64 => write!(f, "arm64"),
        }
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "x64" | "amd64" | "x86_64" => Ok(Architecture::X64),
            "arm" | "armv7" => Ok(Architecture::Arm),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            other => Err(format!(
                "unsupported runner architecture '{other}' (expected x64, arm or arm64)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner release
// ---------------------------------------------------------------------------

pub mod release {
    /// Runner version installed when none is requested.
    pub const DEFAULT_VERSION: &str = "2.169.1";
    /// Base URL runner archives are downloaded from.
    pub const DEFAULT_DOWNLOAD_BASE: &str = "https://github.com/actions/runner/releases/download";
    /// Only Linux archives are supported.
    pub const PLATFORM: &str = "linux";
}

// ---------------------------------------------------------------------------
// Files inside a runner installation
// ---------------------------------------------------------------------------

pub mod path {
    pub const RUN_SCRIPT: &str = "run.sh";
    pub const CONFIG_SCRIPT: &str = "config.sh";
    pub const ARCHIVE: &str = "actions.tar.gz";
    pub const PARTIAL_SUFFIX: &str = ".partial";
    pub const INSTALL_DEPENDENCIES_SCRIPT: &str = "bin/installdependencies.sh";
}

// ---------------------------------------------------------------------------
// Remote API
// ---------------------------------------------------------------------------

pub mod api {
    pub const DEFAULT_API_URL: &str = "https://api.github.com";
    pub const ACCEPT: &str = "application/vnd.github+json";
    pub const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
    pub const API_VERSION: &str = "2022-11-28";

    pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
    pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
    pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

    /// Remaining requests below which a quota warning is logged.
    pub const LOW_QUOTA_WATERMARK: u64 = 50;
}

// ---------------------------------------------------------------------------
// Configure program arguments
// ---------------------------------------------------------------------------

pub mod command_line {
    pub mod args {
        pub const URL: &str = "--url";
        pub const TOKEN: &str = "--token";
        pub const NAME: &str = "--name";
        pub const WORK: &str = "--work";
        pub const LABELS: &str = "--labels";
    }

    pub mod commands {
        pub const REMOVE: &str = "remove";
    }

    pub mod flags {
        pub const UNATTENDED: &str = "--unattended";
        pub const REPLACE: &str = "--replace";
    }
}

// ---------------------------------------------------------------------------
// Environment variables
// ---------------------------------------------------------------------------

pub mod variables {
    pub const TLS_NO_VERIFY: &str = "GITHUB_ACTIONS_RUNNER_TLS_NO_VERIFY";
}

// ---------------------------------------------------------------------------
// Process exit codes
// ---------------------------------------------------------------------------

pub mod return_code {
    /// Every runner reached a successful terminal state.
    pub const SUCCESS: i32 = 0;
    /// The invocation failed before or outside runner dispatch.
    pub const TERMINATED_ERROR: i32 = 1;
    /// At least one runner ended in `Failed`.
    pub const RUNNER_FAILURES: i32 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_round_trips_through_display() {
        for arch in [Architecture::X64, Architecture::Arm, Architecture::Arm64] {
            assert_eq!(arch.to_string().parse::<Architecture>().unwrap(), arch);
        }
    }

    #[test]
    fn architecture_accepts_aliases() {
        assert_eq!("AMD64".parse::<Architecture>().unwrap(), Architecture::X64);
        assert_eq!("aarch64".parse::<Architecture>().unwrap(), Architecture::Arm64);
    }

    #[test]
    fn architecture_rejects_unknown() {
        let err = "sparc".parse::<Architecture>().unwrap_err();
        assert!(err.contains("sparc"));
    }
}
