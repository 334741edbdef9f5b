// launcher-common: Shared services and infrastructure for the runner launcher.
// Depends on `launcher-sdk`; holds the launcher context, settings, the launch
// file model, error taxonomy, tracing and the HTTP client factory.

pub mod constants;
pub mod errors;
pub mod http_client_factory;
pub mod launch_config;
pub mod launcher_context;
pub mod secret_masker;
pub mod settings;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use constants::Architecture;
pub use errors::LauncherError;
pub use http_client_factory::HttpClientFactory;
pub use launch_config::{LaunchConfig, RunnerConfig, RunnerEnvironment};
pub use launcher_context::{LauncherContext, ShutdownReason};
pub use secret_masker::SecretMasker;
pub use settings::{LauncherSettings, ShutdownPolicy};
pub use self::tracing::{TraceEventType, TraceManager, TraceSetting, Tracing};
