// Stack lock
// Single-row advisory lock so two runs never drive one stack root at once

use super::models::host_name;
use super::store::{StateStore, StoreError, StoreResult};
use crate::config::DEFAULT_LOCK_TTL;
use crate::execution::events::{format_ts, now_ns};

use rusqlite::{params, OptionalExtension};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackLock {
    pub owner: String,
    pub run_id: String,
    pub created_at_ns: i64,
    pub ttl: Duration,
}

impl StackLock {
    pub fn is_expired(&self, now_ns: i64) -> bool {
        let ttl = if self.ttl.is_zero() {
            DEFAULT_LOCK_TTL
        } else {
            self.ttl
        };
        let ttl_ns = i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX);
        now_ns > self.created_at_ns.saturating_add(ttl_ns)
    }
}

/// `user@host`, falling back to the host alone
pub fn default_lock_owner() -> String {
    let host = host_name();
    match std::env::var("USER").or_else(|_| std::env::var("USERNAME")) {
        Ok(user) if !user.trim().is_empty() => format!("{}@{}", user.trim(), host),
        _ => host,
    }
}

impl StateStore {
    pub fn get_lock(&self) -> StoreResult<Option<StackLock>> {
        let conn = self.conn()?;
        let lock = conn
            .query_row(
                "SELECT owner, run_id, created_at_ns, ttl_ns FROM ktl_stack_lock WHERE id = 1",
                [],
                |row| {
                    Ok(StackLock {
                        owner: row.get(0)?,
                        run_id: row.get(1)?,
                        created_at_ns: row.get(2)?,
                        ttl: Duration::from_nanos(row.get::<_, i64>(3)?.max(0) as u64),
                    })
                },
            )
            .optional()?;
        Ok(lock)
    }

    /// Take the lock unless someone else holds an unexpired one
    pub fn acquire_lock(
        &self,
        owner: &str,
        run_id: &str,
        ttl: Duration,
        takeover: bool,
    ) -> StoreResult<StackLock> {
        let owner = if owner.trim().is_empty() {
            default_lock_owner()
        } else {
            owner.trim().to_string()
        };
        let ttl = if ttl.is_zero() { DEFAULT_LOCK_TTL } else { ttl };
        let now = now_ns();

        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        let current = tx
            .query_row(
                "SELECT owner, run_id, created_at_ns, ttl_ns FROM ktl_stack_lock WHERE id = 1",
                [],
                |row| {
                    Ok(StackLock {
                        owner: row.get(0)?,
                        run_id: row.get(1)?,
                        created_at_ns: row.get(2)?,
                        ttl: Duration::from_nanos(row.get::<_, i64>(3)?.max(0) as u64),
                    })
                },
            )
            .optional()?;
        if let Some(cur) = &current {
            if !cur.is_expired(now) && !takeover {
                return Err(StoreError::Locked(format!(
                    "stack state is locked by {:?} (runId={}, createdAt={}, ttl={}); rerun with --takeover to steal the lock",
                    cur.owner,
                    cur.run_id,
                    format_ts(cur.created_at_ns),
                    humantime::format_duration(cur.ttl)
                )));
            }
            if takeover {
                tracing::warn!(previous = %cur.owner, run_id = %cur.run_id, "taking over stack lock");
            }
        }
        let ttl_ns = i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX);
        tx.execute(
            r#"
            INSERT INTO ktl_stack_lock (id, owner, run_id, created_at_ns, ttl_ns) VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET owner = ?1, run_id = ?2, created_at_ns = ?3, ttl_ns = ?4
            "#,
            params![owner, run_id.trim(), now, ttl_ns],
        )?;
        tx.commit()?;
        Ok(StackLock {
            owner,
            run_id: run_id.trim().to_string(),
            created_at_ns: now,
            ttl,
        })
    }

    /// Release only if still held by `owner` for `run_id`
    pub fn release_lock(&self, owner: &str, run_id: &str) -> StoreResult<()> {
        let conn = self.writable()?;
        conn.execute(
            "DELETE FROM ktl_stack_lock WHERE id = 1 AND owner = ?1 AND run_id = ?2",
            params![owner.trim(), run_id.trim()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_contention_and_takeover() {
        let store = StateStore::open_in_memory().unwrap();
        let held = store
            .acquire_lock("alice@h", "r1", Duration::from_secs(60), false)
            .unwrap();
        assert_eq!(store.get_lock().unwrap(), Some(held));

        let err = store
            .acquire_lock("bob@h", "r2", Duration::from_secs(60), false)
            .unwrap_err();
        assert!(err.to_string().contains("locked by \"alice@h\""), "{}", err);

        let stolen = store
            .acquire_lock("bob@h", "r2", Duration::from_secs(60), true)
            .unwrap();
        assert_eq!(stolen.owner, "bob@h");

        // stale owner cannot release the new holder's lock
        store.release_lock("alice@h", "r1").unwrap();
        assert!(store.get_lock().unwrap().is_some());
        store.release_lock("bob@h", "r2").unwrap();
        assert!(store.get_lock().unwrap().is_none());
    }

    #[test]
    fn test_expired_lock_is_reclaimed() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .acquire_lock("alice@h", "r1", Duration::from_nanos(1), false)
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let lock = store
            .acquire_lock("bob@h", "r2", Duration::from_secs(60), false)
            .unwrap();
        assert_eq!(lock.run_id, "r2");
    }
}
