//! Test support: an in-memory cluster
//!
//! [`InMemoryCluster`] implements [`ClusterSession`] over shared in-process
//! state. It interprets the fixed set of statements the engine issues
//! against the coordination tables, enforces lock TTLs against a manually
//! advanced clock, and records every other statement as an applied schema
//! mutation. Failure and schema-disagreement injection make the partial
//! failure paths testable without a cluster.
//!
//! Shipped as a public module so applications can test their own migration
//! flows against it.

use crate::session::{ClusterSession, ExecutionInfo, Row, SessionError, Statement, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct LockRow {
    owner: String,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct State {
    now_secs: u64,
    tables: Vec<String>,
    lock: Option<LockRow>,
    ledger: BTreeMap<String, String>,
    applied: Vec<String>,
    agreement: bool,
    fail_on: Vec<String>,
    disagree_on: Vec<String>,
}

impl State {
    /// Current lock row, dropping it first if the lease has expired.
    fn live_lock(&mut self) -> Option<&LockRow> {
        let expired = self
            .lock
            .as_ref()
            .map_or(false, |row| row.expires_at <= self.now_secs);
        if expired {
            self.lock = None;
        }
        self.lock.as_ref()
    }
}

/// In-memory `ClusterSession` with a manual clock.
#[derive(Clone)]
pub struct InMemoryCluster {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                agreement: true,
                ..State::default()
            })),
        }
    }

    /// Advance the clock; leases older than their TTL expire.
    pub fn advance(&self, secs: u64) {
        self.state.lock().unwrap().now_secs += secs;
    }

    /// Make any schema statement containing `fragment` fail.
    pub fn fail_on(&self, fragment: &str) {
        self.state.lock().unwrap().fail_on.push(fragment.to_string());
    }

    /// Make any schema statement containing `fragment` execute but report
    /// schema disagreement.
    pub fn disagree_on(&self, fragment: &str) {
        self.state
            .lock()
            .unwrap()
            .disagree_on
            .push(fragment.to_string());
    }

    /// Drop all injected failures and disagreements, e.g. after simulating
    /// a fixed fault.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_on.clear();
        state.disagree_on.clear();
    }

    /// Toggle cluster-wide schema agreement.
    pub fn set_agreement(&self, agreement: bool) {
        self.state.lock().unwrap().agreement = agreement;
    }

    /// Schema statements applied so far, in execution order.
    #[must_use]
    pub fn applied_statements(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    /// Checksum recorded in the ledger for `name`, if any.
    #[must_use]
    pub fn ledger_entry(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().ledger.get(name).cloned()
    }

    /// Seed a raw ledger row, e.g. a path-decorated legacy entry.
    pub fn insert_ledger(&self, name: &str, sha: &str) {
        let mut state = self.state.lock().unwrap();
        state.ledger.insert(name.to_string(), sha.to_string());
        if !state.tables.iter().any(|t| t == "migrations") {
            state.tables.push("migrations".to_string());
        }
    }

    /// Current live lease holder, if any.
    #[must_use]
    pub fn lock_owner(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .live_lock()
            .map(|row| row.owner.clone())
    }

    fn execute_locked(
        &self,
        state: &mut State,
        stmt: &Statement,
    ) -> Result<ExecutionInfo, SessionError> {
        let cql = stmt.cql.trim();
        let agreement = state.agreement;

        if let Some(rest) = cql.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            let table = rest.split_whitespace().next().unwrap_or_default().to_string();
            if !state.tables.contains(&table) {
                state.tables.push(table);
            }
            return Ok(ExecutionInfo {
                was_applied: true,
                rows: Vec::new(),
                schema_in_agreement: agreement,
            });
        }

        if cql.starts_with("INSERT INTO databasechangelock") {
            let owner = text_param(stmt, 1);
            let ttl = int_param(stmt, 2) as u64;
            if let Some(current) = state.live_lock() {
                let row = Row::default().with("lockedby", current.owner.as_str());
                return Ok(ExecutionInfo {
                    was_applied: false,
                    rows: vec![row],
                    schema_in_agreement: agreement,
                });
            }
            state.lock = Some(LockRow {
                owner,
                expires_at: state.now_secs + ttl,
            });
            return Ok(ExecutionInfo::applied());
        }

        if cql.starts_with("UPDATE databasechangelock") {
            let ttl = int_param(stmt, 0) as u64;
            let owner = text_param(stmt, 1);
            let condition = text_param(stmt, 3);
            let now = state.now_secs;
            let held = state.live_lock().map(|row| row.owner.clone());
            if held.as_deref() == Some(condition.as_str()) {
                state.lock = Some(LockRow {
                    owner,
                    expires_at: now + ttl,
                });
                return Ok(ExecutionInfo::applied());
            }
            let rows = held
                .map(|o| vec![Row::default().with("lockedby", o)])
                .unwrap_or_default();
            return Ok(ExecutionInfo {
                was_applied: false,
                rows,
                schema_in_agreement: agreement,
            });
        }

        if cql.starts_with("DELETE FROM databasechangelock") {
            let condition = text_param(stmt, 1);
            let held = state.live_lock().map(|row| row.owner.clone());
            if held.as_deref() == Some(condition.as_str()) {
                state.lock = None;
                return Ok(ExecutionInfo::applied());
            }
            return Ok(ExecutionInfo {
                was_applied: false,
                rows: Vec::new(),
                schema_in_agreement: agreement,
            });
        }

        if cql.starts_with("SELECT lockedby") {
            let now = state.now_secs;
            let rows = state
                .live_lock()
                .map(|row| {
                    vec![Row::default()
                        .with("lockedby", row.owner.as_str())
                        .with("ttl", (row.expires_at - now) as i64)]
                })
                .unwrap_or_default();
            return Ok(ExecutionInfo {
                was_applied: true,
                rows,
                schema_in_agreement: agreement,
            });
        }

        if cql.starts_with("INSERT INTO migrations") {
            let name = text_param(stmt, 0);
            let sha = text_param(stmt, 1);
            let conditional = cql.ends_with("IF NOT EXISTS");
            if conditional && state.ledger.contains_key(&name) {
                let row = Row::default()
                    .with("name", name.as_str())
                    .with("sha", state.ledger[&name].as_str());
                return Ok(ExecutionInfo {
                    was_applied: false,
                    rows: vec![row],
                    schema_in_agreement: agreement,
                });
            }
            state.ledger.insert(name, sha);
            return Ok(ExecutionInfo::applied());
        }

        if cql.starts_with("SELECT sha FROM migrations") {
            let name = text_param(stmt, 0);
            let rows = state
                .ledger
                .get(&name)
                .map(|sha| vec![Row::default().with("sha", sha.as_str())])
                .unwrap_or_default();
            return Ok(ExecutionInfo {
                was_applied: true,
                rows,
                schema_in_agreement: agreement,
            });
        }

        if cql.starts_with("SELECT name, sha FROM migrations") {
            let rows = state
                .ledger
                .iter()
                .map(|(name, sha)| {
                    Row::default()
                        .with("name", name.as_str())
                        .with("sha", sha.as_str())
                })
                .collect();
            return Ok(ExecutionInfo {
                was_applied: true,
                rows,
                schema_in_agreement: agreement,
            });
        }

        if cql.starts_with("DELETE FROM migrations") {
            let name = text_param(stmt, 0);
            let removed = state.ledger.remove(&name).is_some();
            return Ok(ExecutionInfo {
                was_applied: removed,
                rows: Vec::new(),
                schema_in_agreement: agreement,
            });
        }

        // Anything else is a schema mutation from a migration.
        if state.fail_on.iter().any(|frag| cql.contains(frag.as_str())) {
            return Err(SessionError::Statement(format!(
                "injected failure for `{cql}`"
            )));
        }
        state.applied.push(cql.to_string());
        let disagree = state
            .disagree_on
            .iter()
            .any(|frag| cql.contains(frag.as_str()));
        Ok(ExecutionInfo {
            was_applied: true,
            rows: Vec::new(),
            schema_in_agreement: agreement && !disagree,
        })
    }
}

impl ClusterSession for InMemoryCluster {
    fn execute(&self, stmt: &Statement) -> Result<ExecutionInfo, SessionError> {
        let mut state = self.state.lock().unwrap();
        self.execute_locked(&mut state, stmt)
    }

    fn schema_in_agreement(&self) -> Result<bool, SessionError> {
        Ok(self.state.lock().unwrap().agreement)
    }

    fn table_exists(&self, table: &str) -> Result<bool, SessionError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tables
            .iter()
            .any(|t| t == table))
    }
}

fn text_param(stmt: &Statement, index: usize) -> String {
    match stmt.params.get(index) {
        Some(Value::Text(s)) => s.clone(),
        other => panic!("expected text param at {index} of `{}`, got {other:?}", stmt.cql),
    }
}

fn int_param(stmt: &Statement, index: usize) -> i64 {
    match stmt.params.get(index) {
        Some(Value::Int(v)) => *v,
        other => panic!("expected int param at {index} of `{}`, got {other:?}", stmt.cql),
    }
}
