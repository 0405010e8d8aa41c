//! Post-coordination handlers
//!
//! What actually happens to a pending migration once the coordinator hands
//! it over. A closed set of variants selected by configuration, all
//! conforming to the same `handle(name, content)` contract.

use crate::checksum::checksum_of;
use crate::error::MigrationError;
use crate::ledger::canonical_name;
use crate::migrator::{ApplyOutcome, Migrator};
use std::process::Command;

pub enum Handler<'a> {
    /// Execute the migration's statements in-process. The default.
    Apply(&'a Migrator<'a>),
    /// Record the checksum without executing anything; used when the schema
    /// change is known to already be in effect.
    MarkComplete(&'a Migrator<'a>),
    /// Delegate execution to an external tool and mark on success. The
    /// command is split on whitespace; the migration content is appended as
    /// the final argument.
    ExecuteExternally {
        migrator: &'a Migrator<'a>,
        command: String,
    },
}

impl Handler<'_> {
    /// # Errors
    ///
    /// Propagates the underlying [`Migrator`] errors; the external variant
    /// additionally reports a failed or non-zero-exit command as
    /// `Execution`.
    pub fn handle(&self, name: &str, content: &str) -> Result<ApplyOutcome, MigrationError> {
        match self {
            Handler::Apply(migrator) => migrator.apply(name, content),
            Handler::MarkComplete(migrator) => migrator.mark_complete(name, content),
            Handler::ExecuteExternally { migrator, command } => {
                execute_externally(migrator, command, name, content)
            }
        }
    }
}

fn execute_externally(
    migrator: &Migrator<'_>,
    command: &str,
    name: &str,
    content: &str,
) -> Result<ApplyOutcome, MigrationError> {
    let name = canonical_name(name);
    let sha = checksum_of(content);
    if let Some(outcome) = migrator.recorded_disposition(name, &sha)? {
        return Ok(outcome);
    }

    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return Err(MigrationError::SetupPrecheck(
            "external handler selected but the command is empty".to_string(),
        ));
    };

    log::info!("running migration {name} externally via {program}");
    let status = Command::new(program)
        .args(parts)
        .arg(content)
        .status()
        .map_err(|e| MigrationError::Execution {
            name: name.to_string(),
            statement: command.to_string(),
            reason: format!("failed to spawn external command: {e}"),
            completed: Vec::new(),
        })?;

    if !status.success() {
        return Err(MigrationError::Execution {
            name: name.to_string(),
            statement: command.to_string(),
            reason: format!("external command exited with {status}"),
            completed: Vec::new(),
        });
    }

    // The tool ran the content itself; record it after the fact. Under
    // override the mark is upserted so the recorded checksum moves with
    // the content.
    migrator.ledger().mark_override(name, &sha)?;
    Ok(ApplyOutcome::Applied)
}
