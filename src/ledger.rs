//! Migration ledger
//!
//! Durable record of which migrations have been applied and with what
//! content checksum. One row per migration name in the `migrations` table.
//! All mutations are conditional writes; ownership of the writes is gated by
//! the lease lock before any migration is applied, so a racing `IF NOT
//! EXISTS` here is defense in depth, not the primary exclusion mechanism.

use crate::error::MigrationError;
use crate::session::{ClusterSession, Statement};

const CREATE_LEDGER_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS migrations (name text, sha text, PRIMARY KEY (name))";
const SELECT_SHA: &str = "SELECT sha FROM migrations WHERE name = ?";
const SELECT_ALL: &str = "SELECT name, sha FROM migrations";
const INSERT_MARK: &str = "INSERT INTO migrations (name, sha) VALUES (?, ?) IF NOT EXISTS";
const UPSERT_MARK: &str = "INSERT INTO migrations (name, sha) VALUES (?, ?)";
const DELETE_MARK: &str = "DELETE FROM migrations WHERE name = ? IF EXISTS";

/// Strip any path decoration left by older tooling.
///
/// The ledger is keyed by the bare migration name; entries written by
/// earlier versions used full paths.
#[must_use]
pub fn canonical_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

pub struct Ledger<'a> {
    session: &'a dyn ClusterSession,
}

impl<'a> Ledger<'a> {
    pub fn new(session: &'a dyn ClusterSession) -> Self {
        Self { session }
    }

    /// Create the ledger table if missing.
    ///
    /// Fails fast if the cluster's schema already disagrees before any
    /// migration work starts, and verifies agreement again after creating
    /// the table. Safe to call concurrently from multiple processes.
    ///
    /// # Errors
    ///
    /// Returns `SetupPrecheck` on either agreement failure, or `Session` on
    /// a store error.
    pub fn ensure_schema(&self) -> Result<(), MigrationError> {
        if !self.session.schema_in_agreement()? {
            return Err(MigrationError::SetupPrecheck(
                "migration table setup precheck: schema not in agreement".to_string(),
            ));
        }
        if self.session.table_exists("migrations")? {
            return Ok(());
        }
        log::info!("migrations table not found, creating");
        let info = self
            .session
            .execute(&Statement::quorum(CREATE_LEDGER_TABLE))?;
        if !info.schema_in_agreement {
            return Err(MigrationError::SetupPrecheck(
                "migration table creation postcheck: schema not in agreement".to_string(),
            ));
        }
        Ok(())
    }

    /// Checksum recorded for a migration, if it was ever applied.
    ///
    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn checksum_of(&self, name: &str) -> Result<Option<String>, MigrationError> {
        let stmt = Statement::quorum(SELECT_SHA).bind(canonical_name(name));
        let info = self.session.execute(&stmt)?;
        Ok(info
            .rows
            .first()
            .and_then(|row| row.get_str("sha"))
            .map(str::to_string))
    }

    /// Conditionally record a migration as applied.
    ///
    /// Returns `false` when another process already recorded this name; the
    /// caller must not execute the migration's statements in that case.
    ///
    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn mark_if_absent(&self, name: &str, sha: &str) -> Result<bool, MigrationError> {
        let stmt = Statement::quorum(INSERT_MARK)
            .bind(canonical_name(name))
            .bind(sha);
        let info = self.session.execute(&stmt)?;
        Ok(info.was_applied)
    }

    /// Unconditionally record a migration, bypassing the race check.
    ///
    /// Used only when override mode was explicitly requested; the operator
    /// accepts the risk.
    ///
    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn mark_override(&self, name: &str, sha: &str) -> Result<(), MigrationError> {
        let stmt = Statement::quorum(UPSERT_MARK)
            .bind(canonical_name(name))
            .bind(sha);
        self.session.execute(&stmt)?;
        Ok(())
    }

    /// Remove the mark for a migration whose statements failed partway,
    /// returning it to "not yet attempted" so a retry is possible.
    ///
    /// A rejected delete (someone else already changed the record) is logged
    /// but not fatal: the original statement failure is the error worth
    /// surfacing.
    ///
    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn unmark(&self, name: &str) -> Result<(), MigrationError> {
        let name = canonical_name(name);
        let info = self
            .session
            .execute(&Statement::quorum(DELETE_MARK).bind(name))?;
        if !info.was_applied {
            log::error!("removing migration mark failed for {name}");
        }
        Ok(())
    }

    /// Normalize entries written by older tooling under path-decorated names.
    ///
    /// Re-inserts each `some/path/name.cql` entry under its bare name when
    /// not already present. Additive: legacy rows are never deleted, and
    /// repeated runs are a fixed point. Returns the number of entries
    /// backfilled.
    ///
    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn backfill(&self) -> Result<usize, MigrationError> {
        if !self.session.table_exists("migrations")? {
            return Ok(0);
        }
        log::info!("checking for migration records that need to be backfilled");
        let info = self.session.execute(&Statement::quorum(SELECT_ALL))?;
        let mut backfilled = 0;
        for row in &info.rows {
            let (Some(name), Some(sha)) = (row.get_str("name"), row.get_str("sha")) else {
                continue;
            };
            if !name.contains('/') {
                continue;
            }
            let truncated = canonical_name(name);
            let insert = Statement::quorum(INSERT_MARK).bind(truncated).bind(sha);
            if self.session.execute(&insert)?.was_applied {
                backfilled += 1;
                log::info!("backfilled migration record: {name} -> {truncated}");
            }
        }
        log::info!("{backfilled} migration records backfilled");
        Ok(backfilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryCluster;

    #[test]
    fn canonical_name_strips_path_decoration() {
        assert_eq!(canonical_name("migrations/v1/001_users.cql"), "001_users.cql");
        assert_eq!(canonical_name("001_users.cql"), "001_users.cql");
        assert_eq!(canonical_name(""), "");
    }

    #[test]
    fn mark_if_absent_wins_once() {
        let cluster = InMemoryCluster::new();
        let ledger = Ledger::new(&cluster);
        ledger.ensure_schema().unwrap();

        assert!(ledger.mark_if_absent("001.cql", "aaa").unwrap());
        assert!(!ledger.mark_if_absent("001.cql", "bbb").unwrap());
        assert_eq!(ledger.checksum_of("001.cql").unwrap().as_deref(), Some("aaa"));
    }

    #[test]
    fn mark_override_replaces_existing_checksum() {
        let cluster = InMemoryCluster::new();
        let ledger = Ledger::new(&cluster);
        ledger.ensure_schema().unwrap();

        assert!(ledger.mark_if_absent("001.cql", "aaa").unwrap());
        ledger.mark_override("001.cql", "bbb").unwrap();
        assert_eq!(ledger.checksum_of("001.cql").unwrap().as_deref(), Some("bbb"));
    }

    #[test]
    fn unmark_allows_retry() {
        let cluster = InMemoryCluster::new();
        let ledger = Ledger::new(&cluster);
        ledger.ensure_schema().unwrap();

        assert!(ledger.mark_if_absent("001.cql", "aaa").unwrap());
        ledger.unmark("001.cql").unwrap();
        assert_eq!(ledger.checksum_of("001.cql").unwrap(), None);
        assert!(ledger.mark_if_absent("001.cql", "aaa").unwrap());
    }

    #[test]
    fn unmark_of_absent_entry_is_not_fatal() {
        let cluster = InMemoryCluster::new();
        let ledger = Ledger::new(&cluster);
        ledger.ensure_schema().unwrap();

        ledger.unmark("never_marked.cql").unwrap();
    }

    #[test]
    fn checksum_lookup_uses_canonical_name() {
        let cluster = InMemoryCluster::new();
        let ledger = Ledger::new(&cluster);
        ledger.ensure_schema().unwrap();

        assert!(ledger.mark_if_absent("001.cql", "aaa").unwrap());
        assert_eq!(
            ledger.checksum_of("old/path/001.cql").unwrap().as_deref(),
            Some("aaa")
        );
    }

    #[test]
    fn backfill_normalizes_legacy_names() {
        let cluster = InMemoryCluster::new();
        let ledger = Ledger::new(&cluster);
        ledger.ensure_schema().unwrap();
        cluster.insert_ledger("cassandra/migrations/001.cql", "aaa");
        cluster.insert_ledger("cassandra/migrations/002.cql", "bbb");
        cluster.insert_ledger("003.cql", "ccc");

        assert_eq!(ledger.backfill().unwrap(), 2);
        assert_eq!(ledger.checksum_of("001.cql").unwrap().as_deref(), Some("aaa"));
        assert_eq!(ledger.checksum_of("002.cql").unwrap().as_deref(), Some("bbb"));
        // Legacy rows stay.
        assert_eq!(
            cluster.ledger_entry("cassandra/migrations/001.cql").as_deref(),
            Some("aaa")
        );
    }

    #[test]
    fn backfill_is_a_fixed_point() {
        let cluster = InMemoryCluster::new();
        let ledger = Ledger::new(&cluster);
        ledger.ensure_schema().unwrap();
        cluster.insert_ledger("legacy/001.cql", "aaa");

        assert_eq!(ledger.backfill().unwrap(), 1);
        assert_eq!(ledger.backfill().unwrap(), 0);
    }

    #[test]
    fn ensure_schema_fails_fast_without_agreement() {
        let cluster = InMemoryCluster::new();
        cluster.set_agreement(false);
        let ledger = Ledger::new(&cluster);

        assert!(matches!(
            ledger.ensure_schema(),
            Err(MigrationError::SetupPrecheck(_))
        ));
    }
}
