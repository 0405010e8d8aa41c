//! Migration coordination error taxonomy
//!
//! Every variant here aborts the coordination loop. Lock contention is not an
//! error: it is retried inside [`LeaseLock::acquire`](crate::lock::LeaseLock)
//! and only surfaces as `LockAcquireTimeout` once the retry ceiling is
//! exceeded.

use crate::session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Error from the underlying cluster session.
    #[error("cluster session error: {0}")]
    Session(#[from] SessionError),

    /// The lock stayed contested past the configured ceiling.
    #[error(
        "failed to acquire migration lock within {waited_secs} seconds; \
         another process may be running migrations"
    )]
    LockAcquireTimeout { waited_secs: u64 },

    /// The lease expired and another process took over mid-run. All further
    /// mutation halts; the next holder reconciles via checksum checks.
    #[error("lock ownership lost by '{owner}'; aborting before any further schema mutation")]
    LockOwnershipLost { owner: String },

    /// Conditional release failed while ownership still appears held.
    #[error("unable to release migration lock held by '{owner}'")]
    LockRelease { owner: String },

    /// Recorded checksum differs from the current content and override mode
    /// is off. Content drift never applies silently.
    #[error(
        "checksum of '{name}' is different from the last time it was run \
         (recorded {recorded}, current {current})"
    )]
    Conflict {
        name: String,
        recorded: String,
        current: String,
    },

    /// A statement failed or the cluster could not confirm schema agreement
    /// after it. Statements in `completed` ran before the failure and are
    /// not rolled back; the ledger mark is.
    #[error("migration '{name}' failed at `{statement}`: {reason}")]
    Execution {
        name: String,
        statement: String,
        reason: String,
        completed: Vec<String>,
    },

    /// Structural precondition failed before any migration work began.
    #[error("setup precheck failed: {0}")]
    SetupPrecheck(String),
}
