//! Migration executor
//!
//! Applies one migration's content as an ordered sequence of statements with
//! all-or-recorded-none semantics for the ledger mark. The underlying schema
//! has no transactional rollback: statements that succeeded before a failure
//! stay applied, and the trace of them is the operator's diagnostic.

use crate::checksum::checksum_of;
use crate::error::MigrationError;
use crate::ledger::{canonical_name, Ledger};
use crate::lock::LeaseLock;
use crate::session::{ClusterSession, Statement};

/// One migration as supplied by the external enumerator: a stable name and
/// the full content. Immutable; the engine never owns the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    pub name: String,
    pub content: String,
}

impl MigrationUnit {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Outcome of applying a single migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The recorded checksum already matches, or another process holds the
    /// mark. The steady-state case after a restart; no statements executed.
    SkippedAlreadyApplied,
}

/// Split migration content into executable statements.
///
/// Statements are delimited by `;`, trimmed, and empty fragments dropped.
#[must_use]
pub fn split_statements(content: &str) -> Vec<String> {
    content
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct Migrator<'a> {
    session: &'a dyn ClusterSession,
    lock: &'a LeaseLock<'a>,
    ledger: Ledger<'a>,
    override_allowed: bool,
}

impl<'a> Migrator<'a> {
    pub fn new(
        session: &'a dyn ClusterSession,
        lock: &'a LeaseLock<'a>,
        override_allowed: bool,
    ) -> Self {
        Self {
            session,
            lock,
            ledger: Ledger::new(session),
            override_allowed,
        }
    }

    pub fn ledger(&self) -> &Ledger<'a> {
        &self.ledger
    }

    /// Compare content against the recorded checksum.
    ///
    /// `Ok(Some(_))` means nothing to execute (already applied with the same
    /// content). `Ok(None)` means the migration should run.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the recorded checksum differs and override
    /// mode is off, or `Session` on a store error.
    pub fn recorded_disposition(
        &self,
        name: &str,
        sha: &str,
    ) -> Result<Option<ApplyOutcome>, MigrationError> {
        match self.ledger.checksum_of(name)? {
            Some(recorded) if recorded == sha => {
                log::info!("{name} was already run");
                Ok(Some(ApplyOutcome::SkippedAlreadyApplied))
            }
            Some(recorded) if !self.override_allowed => Err(MigrationError::Conflict {
                name: name.to_string(),
                recorded,
                current: sha.to_string(),
            }),
            _ => Ok(None),
        }
    }

    /// Apply one migration.
    ///
    /// The ledger is marked before any statement executes, making the
    /// attempt visible and second-guarding a concurrent racer; on any
    /// statement failure the mark is rolled back so the migration can be
    /// retried once the fault is fixed.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` on checksum drift without override, `Execution`
    /// when a statement fails or the cluster cannot confirm schema
    /// agreement, `LockOwnershipLost` when the lease is gone, or `Session`
    /// on a store error.
    pub fn apply(&self, name: &str, content: &str) -> Result<ApplyOutcome, MigrationError> {
        let name = canonical_name(name);
        let sha = checksum_of(content);
        if let Some(outcome) = self.recorded_disposition(name, &sha)? {
            return Ok(outcome);
        }

        let marked = if self.override_allowed {
            self.ledger.mark_override(name, &sha)?;
            true
        } else {
            self.ledger.mark_if_absent(name, &sha)?
        };
        if !marked {
            log::warn!("not running {name}: another process has already marked it");
            return Ok(ApplyOutcome::SkippedAlreadyApplied);
        }

        log::info!("running migration {name} with sha {sha}");
        match self.run_statements(name, content) {
            Ok(count) => {
                log::info!("migration {name} applied, {count} statements");
                Ok(ApplyOutcome::Applied)
            }
            // Once ownership is lost every further mutation halts, the
            // unmark included: the next holder may already have re-marked
            // this name, and deleting that record is not ours to do.
            Err(err @ MigrationError::LockOwnershipLost { .. }) => Err(err),
            Err(err) => {
                log::error!("removing mark for migration {name}");
                if let Err(unmark_err) = self.ledger.unmark(name) {
                    log::error!("failed to roll back ledger mark for {name}: {unmark_err}");
                }
                Err(err)
            }
        }
    }

    /// Record a migration as applied without executing its statements.
    ///
    /// Used when the content is known to already be in effect. Existing
    /// entries are left untouched regardless of their checksum.
    ///
    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn mark_complete(&self, name: &str, content: &str) -> Result<ApplyOutcome, MigrationError> {
        let name = canonical_name(name);
        if self.ledger.checksum_of(name)?.is_some() {
            return Ok(ApplyOutcome::SkippedAlreadyApplied);
        }
        log::info!("marking migration {name} as run");
        self.ledger.mark_if_absent(name, &checksum_of(content))?;
        Ok(ApplyOutcome::Applied)
    }

    fn run_statements(&self, name: &str, content: &str) -> Result<usize, MigrationError> {
        let mut completed: Vec<String> = Vec::new();
        for statement in split_statements(content) {
            if let Err(err) = self.execute_with_lock(name, &statement, &completed) {
                if !completed.is_empty() {
                    log::error!(
                        "statements run prior to failure:\n{};",
                        completed.join(";\n")
                    );
                }
                return Err(err);
            }
            completed.push(statement);
        }
        Ok(completed.len())
    }

    /// Execute one statement while re-asserting lease ownership around it.
    ///
    /// The keepalive before the call both refreshes the TTL and proves
    /// ownership; the check after the call catches a lease that expired
    /// while the statement was in flight. Either failure aborts before any
    /// further mutation.
    fn execute_with_lock(
        &self,
        name: &str,
        statement: &str,
        completed: &[String],
    ) -> Result<(), MigrationError> {
        self.lock.keep_alive()?;

        let info = match self.session.execute(&Statement::quorum(statement)) {
            Ok(info) => info,
            Err(e) => {
                return Err(MigrationError::Execution {
                    name: name.to_string(),
                    statement: statement.to_string(),
                    reason: e.to_string(),
                    completed: completed.to_vec(),
                })
            }
        };

        if !self.lock.is_mine()? {
            return Err(MigrationError::LockOwnershipLost {
                owner: self.lock.owner_id().to_string(),
            });
        }

        if !info.schema_in_agreement {
            log::error!("schema is not in agreement");
            return Err(MigrationError::Execution {
                name: name.to_string(),
                statement: statement.to_string(),
                reason: "schema is not in agreement".to_string(),
                completed: completed.to_vec(),
            });
        }
        Ok(())
    }
}
