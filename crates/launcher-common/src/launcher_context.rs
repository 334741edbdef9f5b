// LauncherContext: state scoped to one launcher invocation.
//
// Owns the settings, the shutdown signal shared by every runner task, the
// trace manager and the locks guarding provisioning critical sections.

use crate::secret_masker::SecretMasker;
use crate::settings::LauncherSettings;
use crate::tracing::{TraceManager, Tracing};

use dashmap::DashMap;
use launcher_sdk::TraceWriter;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The reason the launcher is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl-C.
    UserCancelled,
    /// SIGTERM.
    OperatingSystemShutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::OperatingSystemShutdown => write!(f, "OperatingSystemShutdown"),
        }
    }
}

pub struct LauncherContext {
    settings: LauncherSettings,

    /// Cancelled once on shutdown; observed by every runner task and child process.
    shutdown_token: CancellationToken,
    shutdown_reason: Mutex<Option<ShutdownReason>>,

    trace_manager: TraceManager,

    /// Guards the system-wide dependency installation step.
    install_lock: tokio::sync::Mutex<()>,

    /// One lock per resolved work directory.
    work_dir_locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

impl LauncherContext {
    pub fn new(settings: LauncherSettings) -> Arc<Self> {
        Self::with_trace_manager(settings, TraceManager::new(SecretMasker::new()))
    }

    /// Build a context around an existing trace manager (tests route traces to a sink).
    pub fn with_trace_manager(settings: LauncherSettings, trace_manager: TraceManager) -> Arc<Self> {
        Arc::new(Self {
            settings,
            shutdown_token: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
            trace_manager,
            install_lock: tokio::sync::Mutex::new(()),
            work_dir_locks: DashMap::new(),
        })
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Tracing
    // -----------------------------------------------------------------------

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    pub fn secret_masker(&self) -> &SecretMasker {
        self.trace_manager.secret_masker()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// The token cancelled when shutdown is requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_reason.lock()
    }

    /// Request shutdown. The first reason wins; later calls only log.
    pub fn shutdown(&self, reason: ShutdownReason) {
        let trace = self.get_trace("LauncherContext");
        {
            let mut current = self.shutdown_reason.lock();
            match *current {
                Some(existing) => {
                    trace.info(&format!(
                        "Shutdown already in progress ({existing}), ignoring {reason}"
                    ));
                    return;
                }
                None => *current = Some(reason),
            }
        }
        trace.info(&format!("Launcher will shut down all runners for {reason}"));
        self.shutdown_token.cancel();
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    /// Exclusive lock for the dependency installation step.
    pub async fn lock_install(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.install_lock.lock().await
    }

    /// Exclusive lock for provisioning `work_dir`.
    pub async fn lock_work_dir(&self, work_dir: &Path) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .work_dir_locks
            .entry(work_dir.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use launcher_sdk::trace::{CollectingTraceWriter, TraceLevel};
    use std::time::Duration;

    fn context_with_sink() -> (Arc<LauncherContext>, Arc<CollectingTraceWriter>) {
        let sink = Arc::new(CollectingTraceWriter::new());
        let manager = TraceManager::with_sink(SecretMasker::new(), sink.clone());
        (
            LauncherContext::with_trace_manager(LauncherSettings::default(), manager),
            sink,
        )
    }

    #[tokio::test]
    async fn shutdown_cancels_token_once() {
        let (context, sink) = context_with_sink();
        let token = context.shutdown_token();
        assert!(!token.is_cancelled());

        context.shutdown(ShutdownReason::UserCancelled);
        context.shutdown(ShutdownReason::OperatingSystemShutdown);

        assert!(token.is_cancelled());
        assert_eq!(context.shutdown_reason(), Some(ShutdownReason::UserCancelled));
        assert!(sink.contains(TraceLevel::Info, "ignoring OperatingSystemShutdown"));
    }

    #[tokio::test]
    async fn work_dir_lock_serializes_same_path() {
        let (context, _) = context_with_sink();
        let dir = PathBuf::from("/srv/runner-a");

        let guard = context.lock_work_dir(&dir).await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), context.lock_work_dir(&dir)).await;
        assert!(blocked.is_err());

        // A different workdir is independent.
        let other =
            tokio::time::timeout(Duration::from_millis(50), context.lock_work_dir(Path::new("/srv/b")))
                .await;
        assert!(other.is_ok());

        drop(guard);
        let acquired =
            tokio::time::timeout(Duration::from_millis(50), context.lock_work_dir(&dir)).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn traces_share_the_masker() {
        let (context, sink) = context_with_sink();
        context.secret_masker().add_value("tok123");
        context.get_trace("Broker").info("got tok123");
        assert!(sink.contains(TraceLevel::Info, "got ***"));
    }
}
