// Entry point of the runner launcher.
//
// Parses the command line, loads the launch file, wires SIGINT/SIGTERM to the
// launcher context and hands over to the fleet orchestrator.

use clap::Parser;
use launcher_common::constants::return_code;
use launcher_common::{LaunchConfig, LauncherContext, LauncherError, ShutdownReason};
use launcher_sdk::build_constants::{LauncherPackage, Source};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use runner_launcher::command_settings::CommandSettings;
use runner_launcher::fleet::Launcher;

fn main() {
    let settings = CommandSettings::parse();
    init_tracing(&settings.options.log);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to build Tokio runtime: {e}");
            std::process::exit(return_code::TERMINATED_ERROR);
        }
    };

    let exit_code = runtime.block_on(run(settings));
    std::process::exit(exit_code);
}

/// `RUST_LOG` wins over `--log`.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(settings: CommandSettings) -> i32 {
    tracing::info!("Runner launcher starting.");
    tracing::info!("  Version = {}", LauncherPackage::VERSION);
    tracing::info!("  Commit  = {}", Source::COMMIT_HASH);

    let Some(config_path) = settings.options.config.clone() else {
        tracing::error!("No launch file given; pass --config or set CONFIG");
        return return_code::TERMINATED_ERROR;
    };

    let config = match LaunchConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return return_code::TERMINATED_ERROR;
        }
    };

    let launcher_settings = settings.settings();
    tracing::info!(
        "  Runner  = {} ({})",
        launcher_settings.runner_version,
        launcher_settings.runner_arch
    );

    let context = LauncherContext::new(launcher_settings);
    listen_for_shutdown(&context);

    let launcher = match Launcher::new(context.clone(), config) {
        Ok(launcher) => launcher,
        Err(e) => {
            tracing::error!("Failed to initialize the launcher: {e:#}");
            return return_code::TERMINATED_ERROR;
        }
    };

    let mode = settings.mode();
    match launcher.run(mode).await {
        Ok(report) => {
            let exit_code = report.exit_code();
            if let Some(reason) = context.shutdown_reason() {
                tracing::info!("Shut down ({reason})");
            }
            tracing::info!("Launcher exiting with code {exit_code}");
            exit_code
        }
        Err(e) => {
            match e.downcast_ref::<LauncherError>() {
                Some(typed) if typed.is_invocation_level() => tracing::error!("{typed}"),
                _ => tracing::error!("Launcher failed: {e:#}"),
            }
            return_code::TERMINATED_ERROR
        }
    }
}

/// Translate Ctrl-C and SIGTERM into a launcher shutdown.
fn listen_for_shutdown(context: &Arc<LauncherContext>) {
    let on_ctrl_c = context.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, stopping runners");
                on_ctrl_c.shutdown(ShutdownReason::UserCancelled);
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {e}"),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let on_sigterm = context.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("SIGTERM received, stopping runners");
                    on_sigterm.shutdown(ShutdownReason::OperatingSystemShutdown);
                }
                Err(e) => tracing::warn!("Failed to listen for SIGTERM: {e}"),
            }
        });
    }
}
