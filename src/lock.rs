//! Cluster-wide TTL lease lock
//!
//! Mutual exclusion is built on conditional writes against a single
//! well-known row of the `databasechangelock` table. The row carries a TTL:
//! if the holder dies without releasing, the lease simply evaporates and the
//! next `acquire` wins. Ownership is only ever proven by a successful
//! conditional write, never assumed from a read, so a holder that outlives
//! its TTL (long GC pause, network stall) loses exclusivity the moment a
//! conditional operation fails.

use crate::error::MigrationError;
use crate::session::{ClusterSession, Statement};
use std::time::{Duration, Instant};

/// Fixed identity of the singleton lock row.
const LOCK_ID: i64 = 1;

const CREATE_LOCK_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS databasechangelock (id int, lockedby text, PRIMARY KEY (id))";
const INSERT_LOCK: &str =
    "INSERT INTO databasechangelock (id, lockedby) VALUES (?, ?) IF NOT EXISTS USING TTL ?";
const UPDATE_LOCK: &str =
    "UPDATE databasechangelock USING TTL ? SET lockedby = ? WHERE id = ? IF lockedby = ?";
const DELETE_LOCK: &str = "DELETE FROM databasechangelock WHERE id = ? IF lockedby = ?";
const SELECT_LOCK: &str =
    "SELECT lockedby, TTL(lockedby) AS ttl FROM databasechangelock WHERE id = ?";

/// Time-bounded exclusive ownership of the migration coordination role.
pub struct LeaseLock<'a> {
    session: &'a dyn ClusterSession,
    owner: String,
    ttl_seconds: u32,
}

impl<'a> LeaseLock<'a> {
    pub fn new(
        session: &'a dyn ClusterSession,
        owner: impl Into<String>,
        ttl_seconds: u32,
    ) -> Self {
        Self {
            session,
            owner: owner.into(),
            ttl_seconds,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner
    }

    /// Create the lock table if missing.
    ///
    /// Safe to race between processes: creation is `IF NOT EXISTS` and gated
    /// on a schema agreement postcheck.
    ///
    /// # Errors
    ///
    /// Returns `SetupPrecheck` if the cluster does not reach agreement on the
    /// created table, or `Session` on a store error.
    pub fn ensure_table(&self) -> Result<(), MigrationError> {
        if self.session.table_exists("databasechangelock")? {
            return Ok(());
        }
        log::info!("lock table not found, creating");
        let info = self.session.execute(&Statement::quorum(CREATE_LOCK_TABLE))?;
        if !info.schema_in_agreement {
            return Err(MigrationError::SetupPrecheck(
                "databasechangelock table creation postcheck: schema not in agreement".to_string(),
            ));
        }
        Ok(())
    }

    /// One conditional attempt to take the lease.
    ///
    /// Returns `false` when a different, non-expired holder has it — the
    /// caller should back off and retry, not spin. Idempotent: if the
    /// rejected write reports this owner as the current holder, the lease is
    /// already ours and the call returns `true`.
    ///
    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn try_lock(&self) -> Result<bool, MigrationError> {
        let stmt = Statement::quorum(INSERT_LOCK)
            .bind(LOCK_ID)
            .bind(self.owner.as_str())
            .bind(i64::from(self.ttl_seconds));
        let info = self.session.execute(&stmt)?;
        if info.was_applied {
            return Ok(true);
        }
        let current = info.rows.first().and_then(|row| row.get_str("lockedby"));
        Ok(current == Some(self.owner.as_str()))
    }

    /// Poll [`try_lock`](Self::try_lock) until the lease is won or the
    /// deadline passes.
    ///
    /// The returned guard releases the lease on drop, so every exit path of
    /// the caller relinquishes it; only a crash during unwind falls back to
    /// TTL expiry.
    ///
    /// # Errors
    ///
    /// Returns `LockAcquireTimeout` once `timeout` elapses with the lock
    /// still contested, or `Session` on a store error.
    pub fn acquire(
        &self,
        timeout: Duration,
        retry_interval: Duration,
    ) -> Result<LockGuard<'_>, MigrationError> {
        let start = Instant::now();
        loop {
            if self.try_lock()? {
                log::debug!("lease acquired by {}", self.owner);
                return Ok(LockGuard { lock: self });
            }
            if start.elapsed() >= timeout {
                return Err(MigrationError::LockAcquireTimeout {
                    waited_secs: timeout.as_secs(),
                });
            }
            log::info!(
                "migration lock is held by another process, retrying in {}ms",
                retry_interval.as_millis()
            );
            std::thread::sleep(retry_interval);
        }
    }

    /// Refresh the TTL, proving ownership in the same conditional write.
    ///
    /// Must be called no less often than the TTL window around any
    /// long-running work performed under the lock.
    ///
    /// # Errors
    ///
    /// Returns `LockOwnershipLost` if the lease has expired and been taken
    /// over (or simply expired), or `Session` on a store error.
    pub fn keep_alive(&self) -> Result<(), MigrationError> {
        let stmt = Statement::quorum(UPDATE_LOCK)
            .bind(i64::from(self.ttl_seconds))
            .bind(self.owner.as_str())
            .bind(LOCK_ID)
            .bind(self.owner.as_str());
        let info = self.session.execute(&stmt)?;
        if !info.was_applied {
            return Err(MigrationError::LockOwnershipLost {
                owner: self.owner.clone(),
            });
        }
        Ok(())
    }

    /// Relinquish the lease.
    ///
    /// A release that fails because ownership was already lost is tolerated
    /// silently: the intended end state (not holding the lock) is already
    /// true.
    ///
    /// # Errors
    ///
    /// Returns `LockRelease` if the conditional delete was rejected while
    /// this process still appears to be the holder, or `Session` on a store
    /// error.
    pub fn unlock(&self) -> Result<(), MigrationError> {
        if !self.is_mine()? {
            return Ok(());
        }
        let stmt = Statement::quorum(DELETE_LOCK)
            .bind(LOCK_ID)
            .bind(self.owner.as_str());
        let info = self.session.execute(&stmt)?;
        if !info.was_applied && self.is_mine()? {
            return Err(MigrationError::LockRelease {
                owner: self.owner.clone(),
            });
        }
        Ok(())
    }

    /// Current holder of the lease, if any. Serial read.
    ///
    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn owner(&self) -> Result<Option<String>, MigrationError> {
        let info = self
            .session
            .execute(&Statement::serial(SELECT_LOCK).bind(LOCK_ID))?;
        Ok(info
            .rows
            .first()
            .and_then(|row| row.get_str("lockedby"))
            .map(str::to_string))
    }

    /// Seconds left on the current lease, zero when unheld. Serial read.
    ///
    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn ttl_remaining(&self) -> Result<i64, MigrationError> {
        let info = self
            .session
            .execute(&Statement::serial(SELECT_LOCK).bind(LOCK_ID))?;
        Ok(info
            .rows
            .first()
            .and_then(|row| row.get_i64("ttl"))
            .unwrap_or(0))
    }

    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn is_locked(&self) -> Result<bool, MigrationError> {
        Ok(self.owner()?.is_some())
    }

    /// # Errors
    ///
    /// Returns `Session` on a store error.
    pub fn is_mine(&self) -> Result<bool, MigrationError> {
        Ok(self.owner()?.as_deref() == Some(self.owner.as_str()))
    }
}

/// Guard that releases the lease when dropped.
///
/// Release errors during drop cannot propagate; they are logged and the TTL
/// remains the backstop.
pub struct LockGuard<'l> {
    lock: &'l LeaseLock<'l>,
}

impl<'l> LockGuard<'l> {
    pub fn lock(&self) -> &'l LeaseLock<'l> {
        self.lock
    }
}

impl std::fmt::Debug for LockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log::warn!("failed to release migration lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryCluster;

    fn lock<'a>(cluster: &'a InMemoryCluster, owner: &str, ttl: u32) -> LeaseLock<'a> {
        LeaseLock::new(cluster, owner, ttl)
    }

    #[test]
    fn mutual_exclusion_with_live_holder() {
        let cluster = InMemoryCluster::new();
        let a = lock(&cluster, "a", 60);
        let b = lock(&cluster, "b", 60);

        assert!(a.try_lock().unwrap());
        assert!(!b.try_lock().unwrap());
        assert_eq!(a.owner().unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn try_lock_is_idempotent_for_same_owner() {
        let cluster = InMemoryCluster::new();
        let a = lock(&cluster, "a", 60);

        assert!(a.try_lock().unwrap());
        assert!(a.try_lock().unwrap());
    }

    #[test]
    fn lease_expires_without_keepalive() {
        let cluster = InMemoryCluster::new();
        let a = lock(&cluster, "a", 2);
        let b = lock(&cluster, "b", 2);

        assert!(a.try_lock().unwrap());
        assert!(!b.try_lock().unwrap());

        // Slightly more than the TTL with no renewal from A.
        cluster.advance(3);
        assert!(b.try_lock().unwrap());
        assert_eq!(b.owner().unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn keepalive_extends_the_lease() {
        let cluster = InMemoryCluster::new();
        let a = lock(&cluster, "a", 2);
        let b = lock(&cluster, "b", 2);

        assert!(a.try_lock().unwrap());
        cluster.advance(1);
        a.keep_alive().unwrap();

        // Past the original expiry, within the renewed lease.
        cluster.advance(1);
        assert!(!b.try_lock().unwrap());
        assert!(a.is_mine().unwrap());
    }

    #[test]
    fn keepalive_fails_after_takeover() {
        let cluster = InMemoryCluster::new();
        let a = lock(&cluster, "a", 2);
        let b = lock(&cluster, "b", 60);

        assert!(a.try_lock().unwrap());
        cluster.advance(3);
        assert!(b.try_lock().unwrap());

        match a.keep_alive() {
            Err(MigrationError::LockOwnershipLost { owner }) => assert_eq!(owner, "a"),
            other => panic!("expected LockOwnershipLost, got {other:?}"),
        }
    }

    #[test]
    fn unlock_tolerates_lost_ownership() {
        let cluster = InMemoryCluster::new();
        let a = lock(&cluster, "a", 2);
        assert!(a.try_lock().unwrap());
        cluster.advance(3);

        a.unlock().unwrap();
    }

    #[test]
    fn acquire_times_out_when_contested() {
        let cluster = InMemoryCluster::new();
        let a = lock(&cluster, "a", 600);
        let b = lock(&cluster, "b", 600);
        assert!(a.try_lock().unwrap());

        let err = b
            .acquire(Duration::from_millis(50), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, MigrationError::LockAcquireTimeout { .. }));
    }

    #[test]
    fn guard_releases_on_drop() {
        let cluster = InMemoryCluster::new();
        let a = lock(&cluster, "a", 60);
        {
            let _guard = a
                .acquire(Duration::from_secs(1), Duration::from_millis(10))
                .unwrap();
            assert!(a.is_mine().unwrap());
        }
        assert!(!a.is_locked().unwrap());
    }

    #[test]
    fn ttl_remaining_reports_seconds_left_on_the_lease() {
        let cluster = InMemoryCluster::new();
        let a = lock(&cluster, "a", 10);
        assert_eq!(a.ttl_remaining().unwrap(), 0);
        assert!(a.try_lock().unwrap());
        cluster.advance(4);
        assert_eq!(a.ttl_remaining().unwrap(), 6);
    }
}
