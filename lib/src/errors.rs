//! The typed error surface at the seams where the CLI needs to match
//! on error kind (the six kinds from the error-handling design) rather
//! than just print a chain of `anyhow` context.

use thiserror::Error;

/// One of the six kinds of failure the engine can produce. Every
/// fallible operation wraps its leaf `anyhow::Error` chain in one of
/// these before it reaches the CLI.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unrecognised flag, malformed URI, invalid UUID, conflicting
    /// labels. Nothing was done; no rollback needed.
    #[error("invalid input: {0:#}")]
    Validation(#[source] anyhow::Error),

    /// Disk missing, insufficient space, partition-table fix failure.
    /// Partitioning is not transactional; no rollback is attempted.
    #[error("preparation failed: {0:#}")]
    Preparation(#[source] anyhow::Error),

    /// OCI pull failure, digest mismatch, rsync failure.
    #[error("unpack failed: {0:#}")]
    Unpack(#[source] anyhow::Error),

    /// Snapshot create/commit/rollback failure, bind-mount failure,
    /// non-zero hook exit.
    #[error("transaction failed: {0:#}")]
    Transaction(#[source] anyhow::Error),

    /// Bootloader install failure or EFI variable write failure.
    #[error("boot configuration failed: {0:#}")]
    Boot(#[source] anyhow::Error),

    /// The operation was cancelled via SIGINT/SIGTERM.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// The process exit code this error should produce: 130 (the
    /// conventional SIGINT status) for cancellation, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Cancelled => 130,
            _ => 1,
        }
    }
}
