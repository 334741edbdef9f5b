// Per-component trace handles.
//
// Every handle masks secrets before anything leaves the process and tags
// events with the component name and, once bound, the runner identity.

use crate::secret_masker::SecretMasker;
use launcher_sdk::TraceWriter;
use std::sync::Arc;

/// Trace event severity, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl std::fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TraceSetting {
    /// Minimum severity level to emit.
    pub level: TraceEventType,
}

impl Default for TraceSetting {
    fn default() -> Self {
        Self {
            level: TraceEventType::Verbose,
        }
    }
}

/// A trace source bound to one component and optionally one runner.
///
/// Without a sink, events go to the `tracing` crate with `component` and
/// `runner` fields. With a sink (tests), the masked message is forwarded to it.
#[derive(Clone)]
pub struct Tracing {
    name: Arc<str>,
    runner: Option<Arc<str>>,
    secret_masker: SecretMasker,
    setting: TraceSetting,
    sink: Option<Arc<dyn TraceWriter>>,
}

impl Tracing {
    pub fn new(name: impl Into<String>, secret_masker: SecretMasker, setting: TraceSetting) -> Self {
        Self {
            name: Arc::from(name.into()),
            runner: None,
            secret_masker,
            setting,
            sink: None,
        }
    }

    /// A copy of this handle tagged with the given runner identity.
    pub fn for_runner(&self, runner: &str) -> Self {
        Self {
            runner: Some(Arc::from(runner)),
            ..self.clone()
        }
    }

    pub fn runner(&self) -> Option<&str> {
        self.runner.as_deref()
    }

    /// Log an error and its chain of causes.
    pub fn error_chain(&self, err: &anyhow::Error) {
        self.error(&format!("{err:#}"));
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        if event_type < self.setting.level {
            return;
        }

        let masked = self.secret_masker.mask(message);

        if let Some(sink) = &self.sink {
            let line = match &self.runner {
                Some(runner) => format!("[{}] {masked}", runner),
                None => masked.into_owned(),
            };
            match event_type {
                TraceEventType::Verbose => sink.verbose(&line),
                TraceEventType::Information => sink.info(&line),
                TraceEventType::Warning => sink.warning(&line),
                TraceEventType::Error => sink.error(&line),
            }
            return;
        }

        let component: &str = &self.name;
        let runner = self.runner.as_deref().unwrap_or("-");
        match event_type {
            TraceEventType::Error => {
                tracing::error!(component, runner, "{}", masked);
            }
            TraceEventType::Warning => {
                tracing::warn!(component, runner, "{}", masked);
            }
            TraceEventType::Information => {
                tracing::info!(component, runner, "{}", masked);
            }
            TraceEventType::Verbose => {
                tracing::debug!(component, runner, "{}", masked);
            }
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out trace sources that share one `SecretMasker`.
pub struct TraceManager {
    secret_masker: SecretMasker,
    default_setting: TraceSetting,
    sink: Option<Arc<dyn TraceWriter>>,
}

impl TraceManager {
    pub fn new(secret_masker: SecretMasker) -> Self {
        Self::with_setting(secret_masker, TraceSetting::default())
    }

    pub fn with_setting(secret_masker: SecretMasker, setting: TraceSetting) -> Self {
        Self {
            secret_masker,
            default_setting: setting,
            sink: None,
        }
    }

    /// Route every trace source to `sink` instead of the `tracing` crate.
    pub fn with_sink(secret_masker: SecretMasker, sink: Arc<dyn TraceWriter>) -> Self {
        Self {
            secret_masker,
            default_setting: TraceSetting::default(),
            sink: Some(sink),
        }
    }

    /// Get (create) a named trace source.
    pub fn get(&self, name: &str) -> Tracing {
        let mut trace = Tracing::new(
            name,
            self.secret_masker.clone(),
            self.default_setting.clone(),
        );
        trace.sink = self.sink.clone();
        trace
    }

    pub fn secret_masker(&self) -> &SecretMasker {
        &self.secret_masker
    }
}
