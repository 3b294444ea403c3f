//! The `Logger` capability: a leveled, pluggable sink so the engine's
//! own status narration doesn't hardcode `tracing` (or stdout) at every
//! call site, and can be discarded entirely in tests.

use std::fmt::Debug;

/// Log levels the engine emits at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

pub(crate) trait Logger: Debug {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message)
    }
    fn info(&self, message: &str) {
        self.log(Level::Info, message)
    }
    fn warn(&self, message: &str) {
        self.log(Level::Warn, message)
    }
    fn error(&self, message: &str) {
        self.log(Level::Error, message)
    }
}

/// Forwards to the `tracing` macros, so engine narration shows up
/// alongside every other crate's spans under the same subscriber.
#[derive(Debug, Default)]
pub(crate) struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => tracing::debug!("{message}"),
            Level::Info => tracing::info!("{message}"),
            Level::Warn => tracing::warn!("{message}"),
            Level::Error => tracing::error!("{message}"),
        }
    }
}

/// Discards everything; used by the in-memory test `System`.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct DiscardLogger;

#[cfg(test)]
impl Logger for DiscardLogger {
    fn log(&self, _level: Level, _message: &str) {}
}
