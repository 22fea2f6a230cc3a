//! Single-invocation guard for the migration.
//!
//! The pipeline is not safe to run twice at once against the same database:
//! concurrent populates race on the unique name, and concurrent rebuilds of
//! the fact table would clobber each other. A run therefore holds a lease
//! row in `shelf_migration_lock` for its whole duration.
//!
//! 1. Acquisition opens an `IMMEDIATE` transaction, so only one writer can
//!    inspect and claim the lease at a time.
//! 2. A live lease held by someone else fails with [`SchemaError::LockHeld`].
//! 3. An expired lease (a crashed run) is taken over.
//! 4. The [`LockGuard`] deletes its row when dropped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SchemaError};

/// Default lease duration.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(600);

const LOCK_TABLE: &str = "shelf_migration_lock";

/// Current holder of a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// A fresh lease starting now; fails if `ttl` does not fit a timestamp.
    fn new(ttl: Duration) -> Result<Self> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or(SchemaError::InvalidLockTtl(ttl))?;
        Ok(Self {
            holder_id: Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at,
        })
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// A held lease; released on drop.
pub struct LockGuard<'c> {
    conn: &'c Connection,
    name: String,
    info: LockInfo,
    released: bool,
}

impl LockGuard<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Release the lease, reporting failure instead of logging it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        delete_lease(self.conn, &self.name, &self.info.holder_id)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = delete_lease(self.conn, &self.name, &self.info.holder_id) {
            warn!(lock = %self.name, error = %e, "failed to release migration lock");
        }
    }
}

/// Claim the lease called `name` for `ttl`.
pub fn acquire<'c>(conn: &'c Connection, name: &str, ttl: Duration) -> Result<LockGuard<'c>> {
    // Reject an unrepresentable lease before touching the database.
    LockInfo::new(ttl)?;

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
             name TEXT PRIMARY KEY,
             holder_id TEXT NOT NULL,
             acquired_at TEXT NOT NULL,
             expires_at TEXT NOT NULL
         )"
    ))
    .map_err(SchemaError::database("create lock table"))?;

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(SchemaError::database("acquire migration lock"))?;

    if let Some(existing) = current_holder(&tx, name)? {
        if !existing.is_expired() {
            return Err(SchemaError::LockHeld {
                name: name.to_string(),
                holder: existing.holder_id,
                expires_at: existing.expires_at,
            });
        }
        warn!(
            lock = %name,
            holder = %existing.holder_id,
            expired_at = %existing.expires_at,
            "taking over expired migration lock"
        );
        tx.execute(
            &format!("DELETE FROM {LOCK_TABLE} WHERE name = ?1"),
            params![name],
        )
        .map_err(SchemaError::database("acquire migration lock"))?;
    }

    let info = LockInfo::new(ttl)?;
    tx.execute(
        &format!(
            "INSERT INTO {LOCK_TABLE} (name, holder_id, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)"
        ),
        params![
            name,
            info.holder_id,
            info.acquired_at.to_rfc3339(),
            info.expires_at.to_rfc3339(),
        ],
    )
    .map_err(SchemaError::database("acquire migration lock"))?;
    tx.commit()
        .map_err(SchemaError::database("acquire migration lock"))?;

    info!(lock = %name, holder = %info.holder_id, expires_at = %info.expires_at, "acquired migration lock");
    Ok(LockGuard {
        conn,
        name: name.to_string(),
        info,
        released: false,
    })
}

/// The lease currently recorded under `name`, if any.
///
/// Unparseable timestamps read as already expired.
pub fn current_holder(conn: &Connection, name: &str) -> Result<Option<LockInfo>> {
    let exists: bool = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![LOCK_TABLE],
            |row| row.get(0),
        )
        .map_err(SchemaError::lookup(format!("table {LOCK_TABLE}")))?;
    if !exists {
        return Ok(None);
    }

    let row: Option<(String, String, String)> = conn
        .query_row(
            &format!("SELECT holder_id, acquired_at, expires_at FROM {LOCK_TABLE} WHERE name = ?1"),
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(SchemaError::database("read migration lock"))?;

    Ok(row.map(|(holder_id, acquired_at, expires_at)| LockInfo {
        holder_id,
        acquired_at: parse_timestamp(&acquired_at),
        expires_at: parse_timestamp(&expires_at),
    }))
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn delete_lease(conn: &Connection, name: &str, holder_id: &str) -> Result<()> {
    let deleted = conn
        .execute(
            &format!("DELETE FROM {LOCK_TABLE} WHERE name = ?1 AND holder_id = ?2"),
            params![name, holder_id],
        )
        .map_err(SchemaError::database("release migration lock"))?;
    if deleted == 0 {
        warn!(lock = %name, holder = %holder_id, "migration lock was taken over before release");
    } else {
        debug!(lock = %name, "released migration lock");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let conn = Connection::open_in_memory().unwrap();
        let guard = acquire(&conn, "normalize:products.department", DEFAULT_LOCK_TTL).unwrap();

        let err = acquire(&conn, "normalize:products.department", DEFAULT_LOCK_TTL)
            .err()
            .unwrap();
        match err {
            SchemaError::LockHeld { holder, .. } => assert_eq!(holder, guard.info().holder_id),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[test]
    fn drop_releases() {
        let conn = Connection::open_in_memory().unwrap();
        {
            let _guard = acquire(&conn, "l", DEFAULT_LOCK_TTL).unwrap();
            assert!(current_holder(&conn, "l").unwrap().is_some());
        }
        assert!(current_holder(&conn, "l").unwrap().is_none());
        assert!(acquire(&conn, "l", DEFAULT_LOCK_TTL).is_ok());
    }

    #[test]
    fn explicit_release() {
        let conn = Connection::open_in_memory().unwrap();
        let guard = acquire(&conn, "l", DEFAULT_LOCK_TTL).unwrap();
        guard.release().unwrap();
        assert!(current_holder(&conn, "l").unwrap().is_none());
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let conn = Connection::open_in_memory().unwrap();
        let stale = acquire(&conn, "l", Duration::ZERO).unwrap();
        let stale_holder = stale.info().holder_id.clone();
        std::mem::forget(stale);

        let fresh = acquire(&conn, "l", DEFAULT_LOCK_TTL).unwrap();
        assert_ne!(fresh.info().holder_id, stale_holder);
        assert_eq!(
            current_holder(&conn, "l").unwrap().unwrap().holder_id,
            fresh.info().holder_id
        );
    }

    #[test]
    fn oversized_ttl_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let ttl = Duration::from_secs(1_000_000_000_000_000);

        match acquire(&conn, "l", ttl).err().unwrap() {
            SchemaError::InvalidLockTtl(rejected) => assert_eq!(rejected, ttl),
            other => panic!("expected InvalidLockTtl, got {other:?}"),
        }
        assert!(current_holder(&conn, "l").unwrap().is_none());
    }

    #[test]
    fn lease_lasts_exactly_the_ttl() {
        let conn = Connection::open_in_memory().unwrap();
        let guard = acquire(&conn, "l", Duration::from_secs(90)).unwrap();
        let info = guard.info();
        assert_eq!(info.expires_at - info.acquired_at, chrono::Duration::seconds(90));
    }

    #[test]
    fn independent_names_do_not_conflict() {
        let conn = Connection::open_in_memory().unwrap();
        let _a = acquire(&conn, "a", DEFAULT_LOCK_TTL).unwrap();
        assert!(acquire(&conn, "b", DEFAULT_LOCK_TTL).is_ok());
    }

    #[test]
    fn garbage_timestamps_read_as_expired() {
        let conn = Connection::open_in_memory().unwrap();
        let _ = acquire(&conn, "seed", DEFAULT_LOCK_TTL).unwrap();
        conn.execute(
            "INSERT INTO shelf_migration_lock VALUES ('l', 'someone', 'soon', 'later')",
            [],
        )
        .unwrap();
        assert!(current_holder(&conn, "l").unwrap().unwrap().is_expired());
    }
}
