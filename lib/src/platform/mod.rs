//! The platform abstraction (filesystem, command runner, mounter,
//! logger) that every other component in this crate consumes by
//! reference instead of touching the real OS directly.
//!
//! No component should hold global state or call `std::fs`/
//! `std::process::Command` on its own; everything goes through the
//! [`System`] bundle so the engine can run against an in-memory
//! filesystem and a recording runner in tests.

mod fs;
mod logger;
mod mount;
mod runner;

pub(crate) use fs::{Fs, Metadata, ProdFs};
pub(crate) use logger::{Logger, TracingLogger};
pub(crate) use mount::{Mounter, ProdMounter};
pub(crate) use runner::{ProdRunner, Runner};

#[cfg(test)]
pub(crate) use fs::TestFs;
#[cfg(test)]
pub(crate) use logger::DiscardLogger;
#[cfg(test)]
pub(crate) use mount::TestMounter;
#[cfg(test)]
pub(crate) use runner::TestRunner;

/// The capability bundle passed down from the CLI entry point into
/// every engine operation. Constructed once; never stashed in a
/// global.
pub(crate) struct System {
    pub(crate) fs: Box<dyn Fs>,
    pub(crate) runner: Box<dyn Runner>,
    pub(crate) mounter: Box<dyn Mounter>,
    pub(crate) logger: Box<dyn Logger>,
}

impl System {
    /// The production bundle: real filesystem, real subprocesses, real
    /// `mount(8)`, and a `tracing`-backed logger.
    pub(crate) fn production() -> Self {
        Self {
            fs: Box::new(ProdFs),
            runner: Box::new(ProdRunner),
            mounter: Box::new(ProdMounter),
            logger: Box::new(TracingLogger),
        }
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System").finish_non_exhaustive()
    }
}

#[cfg(test)]
impl System {
    /// An in-memory bundle for unit tests.
    pub(crate) fn test() -> Self {
        Self {
            fs: Box::new(TestFs::default()),
            runner: Box::new(TestRunner::default()),
            mounter: Box::new(TestMounter::default()),
            logger: Box::new(DiscardLogger),
        }
    }
}
