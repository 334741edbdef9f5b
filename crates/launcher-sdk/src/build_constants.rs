/// Build constants for the launcher package, resolved at compile time.

/// Source control information.
pub struct Source;

impl Source {
    /// The commit hash from which this binary was built.
    /// Set via the `LAUNCHER_COMMIT_HASH` env var at compile time, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("LAUNCHER_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };
}

/// Launcher package metadata.
#[derive(Debug, Clone)]
pub struct LauncherPackage;

impl LauncherPackage {
    /// The semantic version of the launcher, taken from the workspace `Cargo.toml`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// Name used in the HTTP user agent.
    pub const PACKAGE_NAME: &'static str = "github-actions-runner-launcher";

    /// The user agent sent with every HTTP request.
    pub fn user_agent() -> String {
        format!("{}/{}", Self::PACKAGE_NAME, Self::VERSION)
    }
}
