//! Coordinator loop
//!
//! Outer control flow tying lock, ledger, and executor together for a batch
//! of migrations: precheck the cluster, bootstrap the coordination tables,
//! win the lease (or wait for it within the configured ceiling), backfill
//! legacy ledger entries, apply each unit in order, and release the lease on
//! every exit path.

use crate::config::{HandlerKind, MigrationConfig};
use crate::error::MigrationError;
use crate::handler::Handler;
use crate::ledger::Ledger;
use crate::lock::LeaseLock;
use crate::migrator::{ApplyOutcome, MigrationUnit, Migrator};
use crate::session::ClusterSession;
use std::time::Duration;

/// Summary of one coordination run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub applied: usize,
    pub skipped: usize,
    pub backfilled: usize,
}

pub struct Coordinator<'a> {
    session: &'a dyn ClusterSession,
    config: MigrationConfig,
    owner_id: String,
}

impl<'a> Coordinator<'a> {
    pub fn new(session: &'a dyn ClusterSession, config: MigrationConfig) -> Self {
        Self {
            session,
            config,
            owner_id: derive_owner_id(),
        }
    }

    /// Use a caller-supplied owner identity instead of a derived one.
    pub fn with_owner_id(
        session: &'a dyn ClusterSession,
        config: MigrationConfig,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            session,
            config,
            owner_id: owner_id.into(),
        }
    }

    /// Identity this process competes for the lease with. Stable for the
    /// lifetime of the coordinator; recovery after a crash relies on TTL
    /// expiry, not identity memory.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Run every pending migration in the supplied order, exactly once
    /// across the cluster.
    ///
    /// # Errors
    ///
    /// Returns `SetupPrecheck` when the cluster disagrees on its schema
    /// before any work starts, `LockAcquireTimeout` when the lease stays
    /// contested past the configured ceiling, and any [`MigrationError`] a
    /// migration itself raises. The lease is released on every exit path.
    pub fn run(&self, units: &[MigrationUnit]) -> Result<RunReport, MigrationError> {
        // Fail fast, before any lock work, if the cluster already disagrees.
        if !self.session.schema_in_agreement()? {
            return Err(MigrationError::SetupPrecheck(
                "schema not in agreement before migration".to_string(),
            ));
        }

        let lock = LeaseLock::new(self.session, self.owner_id.clone(), self.config.lock_ttl_seconds);
        lock.ensure_table()?;

        let guard = lock.acquire(
            Duration::from_secs(self.config.acquire_timeout_seconds),
            Duration::from_millis(self.config.acquire_retry_ms),
        )?;
        log::info!("starting migration run as {}", self.owner_id);
        let report = self.run_under_lock(guard.lock(), units);
        if report.is_ok() {
            log::info!("done with migration run, releasing lock");
        }
        drop(guard);
        report
    }

    fn run_under_lock(
        &self,
        lock: &LeaseLock<'_>,
        units: &[MigrationUnit],
    ) -> Result<RunReport, MigrationError> {
        let ledger = Ledger::new(self.session);
        ledger.ensure_schema()?;
        let backfilled = ledger.backfill()?;

        let migrator = Migrator::new(self.session, lock, self.config.override_allowed);
        let handler = match self.config.handler {
            HandlerKind::Apply => Handler::Apply(&migrator),
            HandlerKind::MarkComplete => Handler::MarkComplete(&migrator),
            HandlerKind::ExecuteExternally => {
                let command = self.config.external_command.clone().ok_or_else(|| {
                    MigrationError::SetupPrecheck(
                        "external handler selected but no external command configured".to_string(),
                    )
                })?;
                Handler::ExecuteExternally {
                    migrator: &migrator,
                    command,
                }
            }
        };

        let mut report = RunReport {
            backfilled,
            ..RunReport::default()
        };
        for unit in units {
            // Renew the lease between units; long batches must never
            // silently outlive it.
            lock.keep_alive()?;
            log::info!("handling migration {}", unit.name);
            match handler.handle(&unit.name, &unit.content)? {
                ApplyOutcome::Applied => report.applied += 1,
                ApplyOutcome::SkippedAlreadyApplied => report.skipped += 1,
            }
        }
        Ok(report)
    }
}

fn derive_owner_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "cassandra-migrate".to_string());
    format!("{host}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum_of;
    use crate::testing::InMemoryCluster;

    fn quick_config() -> MigrationConfig {
        MigrationConfig {
            acquire_retry_ms: 10,
            acquire_timeout_seconds: 1,
            ..MigrationConfig::default()
        }
    }

    fn units() -> Vec<MigrationUnit> {
        vec![
            MigrationUnit::new("001_users.cql", "CREATE TABLE users (id uuid PRIMARY KEY);"),
            MigrationUnit::new(
                "002_events.cql",
                "CREATE TABLE events (id uuid PRIMARY KEY); ALTER TABLE events ADD at timestamp;",
            ),
        ]
    }

    #[test]
    fn run_applies_pending_migrations_in_order() {
        let cluster = InMemoryCluster::new();
        let coordinator = Coordinator::with_owner_id(&cluster, quick_config(), "a");

        let report = coordinator.run(&units()).unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(cluster.applied_statements().len(), 3);
        // The lease was released at the end of the run.
        assert_eq!(cluster.lock_owner(), None);
    }

    #[test]
    fn second_run_skips_everything() {
        let cluster = InMemoryCluster::new();
        let batch = units();
        Coordinator::with_owner_id(&cluster, quick_config(), "a")
            .run(&batch)
            .unwrap();

        let report = Coordinator::with_owner_id(&cluster, quick_config(), "b")
            .run(&batch)
            .unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(cluster.applied_statements().len(), 3);
    }

    #[test]
    fn contested_lock_times_out() {
        let cluster = InMemoryCluster::new();
        let rival = LeaseLock::new(&cluster, "rival", 600);
        rival.ensure_table().unwrap();
        assert!(rival.try_lock().unwrap());

        let err = Coordinator::with_owner_id(&cluster, quick_config(), "b")
            .run(&units())
            .unwrap_err();
        assert!(matches!(err, MigrationError::LockAcquireTimeout { .. }));
        assert!(cluster.applied_statements().is_empty());
    }

    #[test]
    fn takes_over_after_lease_expiry() {
        let cluster = InMemoryCluster::new();
        let crashed = LeaseLock::new(&cluster, "crashed", 2);
        crashed.ensure_table().unwrap();
        assert!(crashed.try_lock().unwrap());

        // The crashed holder never renews; slightly more than the TTL later
        // a fresh coordinator wins the lease and runs the batch.
        cluster.advance(3);
        let report = Coordinator::with_owner_id(&cluster, quick_config(), "b")
            .run(&units())
            .unwrap();
        assert_eq!(report.applied, 2);
    }

    #[test]
    fn precheck_failure_stops_before_any_lock_work() {
        let cluster = InMemoryCluster::new();
        cluster.set_agreement(false);

        let err = Coordinator::with_owner_id(&cluster, quick_config(), "a")
            .run(&units())
            .unwrap_err();
        assert!(matches!(err, MigrationError::SetupPrecheck(_)));
        assert_eq!(cluster.lock_owner(), None);
    }

    #[test]
    fn lease_released_even_when_a_migration_fails() {
        let cluster = InMemoryCluster::new();
        cluster.fail_on("events");

        let err = Coordinator::with_owner_id(&cluster, quick_config(), "a")
            .run(&units())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Execution { .. }));
        assert_eq!(cluster.lock_owner(), None);
        // The failed migration can be retried once the fault is fixed.
        assert_eq!(cluster.ledger_entry("002_events.cql"), None);
        assert_eq!(
            cluster.ledger_entry("001_users.cql").as_deref(),
            Some(checksum_of("CREATE TABLE users (id uuid PRIMARY KEY);").as_str())
        );
    }

    #[test]
    fn backfill_runs_before_the_batch() {
        let cluster = InMemoryCluster::new();
        let content = "CREATE TABLE users (id uuid PRIMARY KEY);";
        Ledger::new(&cluster).ensure_schema().unwrap();
        cluster.insert_ledger("old/path/001_users.cql", &checksum_of(content));

        let batch = vec![MigrationUnit::new("001_users.cql", content)];
        let report = Coordinator::with_owner_id(&cluster, quick_config(), "a")
            .run(&batch)
            .unwrap();
        assert_eq!(report.backfilled, 1);
        // The backfilled record makes the unit a skip, not a re-run.
        assert_eq!(report.skipped, 1);
        assert!(cluster.applied_statements().is_empty());
    }

    #[test]
    fn external_handler_requires_a_command() {
        let cluster = InMemoryCluster::new();
        let config = MigrationConfig {
            handler: HandlerKind::ExecuteExternally,
            ..quick_config()
        };

        let err = Coordinator::with_owner_id(&cluster, config, "a")
            .run(&units())
            .unwrap_err();
        assert!(matches!(err, MigrationError::SetupPrecheck(_)));
        assert_eq!(cluster.lock_owner(), None);
    }

    #[test]
    fn derived_owner_ids_are_unique_per_process() {
        let a = derive_owner_id();
        let b = derive_owner_id();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }
}
