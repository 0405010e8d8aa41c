//! # cassandra-migrate
//!
//! Schema migration coordination for Cassandra-style, eventually consistent
//! clusters. Guarantees that an ordered set of migrations is applied exactly
//! once across the whole cluster, even when several independent processes
//! (redundant deployment agents, rolling restarts) start concurrently.
//!
//! The engine is built from:
//! - a cluster-wide TTL lease lock over a single well-known row,
//! - a migration ledger keyed by name and content checksum,
//! - a sequential statement executor with ledger-mark rollback on failure,
//! - a coordinator loop tying them together.
//!
//! Driver bootstrap, credentials, CLI parsing, and migration-file discovery
//! stay with the caller: the engine consumes a [`ClusterSession`] capability
//! and an ordered slice of [`MigrationUnit`]s.
//!
//! ```rust,no_run
//! use cassandra_migrate::{ClusterSession, Coordinator, MigrationConfig, MigrationUnit};
//!
//! fn migrate(session: &dyn ClusterSession) -> Result<(), cassandra_migrate::MigrationError> {
//!     let units = vec![
//!         MigrationUnit::new("001_users.cql", "CREATE TABLE users (id uuid PRIMARY KEY);"),
//!         MigrationUnit::new("002_events.cql", "CREATE TABLE events (id uuid PRIMARY KEY);"),
//!     ];
//!     let report = Coordinator::new(session, MigrationConfig::default()).run(&units)?;
//!     log::info!("applied {}, skipped {}", report.applied, report.skipped);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod lock;
pub mod migrator;
pub mod session;
pub mod testing;

pub use config::{HandlerKind, MigrationConfig};
pub use coordinator::{Coordinator, RunReport};
pub use error::MigrationError;
pub use handler::Handler;
pub use ledger::{canonical_name, Ledger};
pub use lock::{LeaseLock, LockGuard};
pub use migrator::{split_statements, ApplyOutcome, MigrationUnit, Migrator};
pub use session::{
    ClusterSession, Consistency, ExecutionInfo, Row, SessionError, Statement, Value,
};
