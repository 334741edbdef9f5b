// launcher-sdk: Foundation layer for the runner launcher.
// This crate has ZERO dependencies on other launcher crates and provides
// the trace sink abstraction, child-process invocation and small utilities.

pub mod build_constants;
pub mod process_invoker;
pub mod string_util;
pub mod trace;

// Re-export commonly used items at crate root
pub use build_constants::{LauncherPackage, Source};
pub use process_invoker::{
    ProcessDataReceivedEventArgs, ProcessExitCodeError, ProcessInvoker, ProcessOutcome,
};
pub use string_util::StringUtil;
pub use trace::TraceWriter;
