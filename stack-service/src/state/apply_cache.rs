// Apply cache
// Content fingerprints that let an unchanged release skip its resource phase

use super::store::{StateStore, StoreResult};
use crate::config::StackCommand;
use crate::execution::events::now_ns;
use crate::stack::ResolvedRelease;

use rusqlite::{params, OptionalExtension};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApplyCacheKey {
    pub namespace: String,
    pub release_name: String,
    pub command: String,
}

impl ApplyCacheKey {
    pub fn for_node(node: &ResolvedRelease, command: StackCommand) -> Self {
        let namespace = node.namespace.trim();
        Self {
            namespace: if namespace.is_empty() {
                "default".to_string()
            } else {
                namespace.to_string()
            },
            release_name: node.name.trim().to_string(),
            command: command.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyCacheEntry {
    pub desired_digest: String,
    pub observed_digest: String,
    pub has_hooks: bool,
    pub run_id: String,
    pub updated_at_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheReason {
    NoStore,
    HasHooks,
    DigestMatch,
    DigestMiss,
}

impl CacheReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheReason::NoStore => "no-store",
            CacheReason::HasHooks => "has-hooks",
            CacheReason::DigestMatch => "digest-match",
            CacheReason::DigestMiss => "digest-miss",
        }
    }
}

impl fmt::Display for CacheReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of consulting the cache before a resource phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyCacheDecision {
    pub skip: bool,
    pub cache_hit: bool,
    pub reason: CacheReason,
    pub desired_digest: String,
    pub observed_digest: String,
    pub has_hooks: bool,
}

/// Decide whether the resource phase for `key` can be skipped
///
/// Releases with hooks never skip. With an `observed` digest from the
/// backend, it must also equal the digest recorded after the last apply.
pub fn check_apply_cache(
    store: Option<&StateStore>,
    key: &ApplyCacheKey,
    desired: &str,
    has_hooks: bool,
    observed: Option<&str>,
) -> StoreResult<ApplyCacheDecision> {
    let desired = desired.trim();
    let mut decision = ApplyCacheDecision {
        skip: false,
        cache_hit: false,
        reason: CacheReason::NoStore,
        desired_digest: desired.to_string(),
        observed_digest: observed.unwrap_or_default().trim().to_string(),
        has_hooks,
    };
    let Some(store) = store else {
        return Ok(decision);
    };

    let entry = store.get_apply_cache(key)?;
    decision.cache_hit = entry.is_some();
    if has_hooks {
        decision.reason = CacheReason::HasHooks;
        return Ok(decision);
    }

    let matched = entry.is_some_and(|e| {
        !desired.is_empty()
            && e.desired_digest == desired
            && !e.has_hooks
            && observed.map_or(true, |o| o.trim() == e.observed_digest)
    });
    decision.skip = matched;
    decision.reason = if matched {
        CacheReason::DigestMatch
    } else {
        CacheReason::DigestMiss
    };
    Ok(decision)
}

impl StateStore {
    pub fn get_apply_cache(&self, key: &ApplyCacheKey) -> StoreResult<Option<ApplyCacheEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT desired_digest, observed_digest, has_hooks, run_id, updated_at_ns \
                 FROM ktl_stack_apply_cache WHERE namespace = ?1 AND release_name = ?2 AND command = ?3",
                params![key.namespace, key.release_name, key.command],
                |row| {
                    Ok(ApplyCacheEntry {
                        desired_digest: row.get(0)?,
                        observed_digest: row.get(1)?,
                        has_hooks: row.get::<_, i64>(2)? != 0,
                        run_id: row.get(3)?,
                        updated_at_ns: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    pub fn upsert_apply_cache(
        &self,
        key: &ApplyCacheKey,
        desired: &str,
        observed: &str,
        has_hooks: bool,
        run_id: &str,
    ) -> StoreResult<()> {
        let conn = self.writable()?;
        conn.execute(
            r#"
            INSERT INTO ktl_stack_apply_cache
              (namespace, release_name, command, desired_digest, observed_digest, has_hooks, run_id, updated_at_ns)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(namespace, release_name, command) DO UPDATE SET
              desired_digest = ?4, observed_digest = ?5, has_hooks = ?6, run_id = ?7, updated_at_ns = ?8
            "#,
            params![
                key.namespace,
                key.release_name,
                key.command,
                desired.trim(),
                observed.trim(),
                has_hooks as i64,
                run_id,
                now_ns()
            ],
        )?;
        tracing::debug!(
            namespace = %key.namespace,
            release = %key.release_name,
            command = %key.command,
            "apply cache updated"
        );
        Ok(())
    }

    /// Drop every command's entry for a release
    pub fn delete_apply_cache(&self, namespace: &str, release_name: &str) -> StoreResult<()> {
        let conn = self.writable()?;
        conn.execute(
            "DELETE FROM ktl_stack_apply_cache WHERE namespace = ?1 AND release_name = ?2",
            params![namespace, release_name],
        )?;
        Ok(())
    }
}
