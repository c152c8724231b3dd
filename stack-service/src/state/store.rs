// State Store
// SQLite-backed run rows, node status and the hash-chained event log

use super::integrity::{compute_event_integrity, compute_run_digest, verify_chain};
use super::models::{
    FailureCluster, NewRun, NodeState, NodeStatus, OperatorMeta, RunListEntry, RunPlan,
    RunRecord, RunStatus, RunSummary,
};
use crate::execution::events::{format_ts, now_ns, EventType, RunError, RunEvent};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Location of the database under a stack root
pub const STATE_DB_REL_PATH: &str = ".ktl/stack/state.sqlite";

const SCHEMA_SQL: &str = include_str!("schema.sql");

const EVENT_COLUMNS: &str = "id, ts_ns, node_id, type, attempt, message, fields_json, \
     error_class, error_message, error_digest, seq, prev_digest, digest, crc32";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encode state: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("run {0:?} not found")]
    RunNotFound(String),

    #[error("no runs recorded in {0}")]
    NoRuns(String),

    #[error("{0}")]
    Integrity(String),

    #[error("{0}")]
    Locked(String),

    #[error("state store is read-only")]
    ReadOnly,

    #[error("state store connection poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to one stack root's state database
///
/// The connection sits behind a mutex so every write is one short
/// transaction and concurrent node workers never interleave inside one.
pub struct StateStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    read_only: bool,
}

impl StateStore {
    pub fn db_path(root: &Path) -> PathBuf {
        root.join(STATE_DB_REL_PATH)
    }

    /// Open (creating if needed) the database for a stack root
    pub fn open(root: &Path) -> StoreResult<Self> {
        let path = Self::db_path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Self::init(&conn)?;
        tracing::debug!(path = %path.display(), "stack state opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            read_only: false,
        })
    }

    /// Open an existing database without write access
    pub fn open_read_only(root: &Path) -> StoreResult<Self> {
        let path = Self::db_path(root);
        if !path.exists() {
            return Err(StoreError::NoRuns(path.display().to_string()));
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_millis(5000))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            read_only: true,
        })
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            read_only: false,
        })
    }

    fn init(conn: &Connection) -> StoreResult<()> {
        conn.busy_timeout(Duration::from_millis(5000))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", 1)?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub(super) fn writable(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        self.conn()
    }

    // ------------------------------------------------------------------
    // runs
    // ------------------------------------------------------------------

    /// Insert the run row and one `planned` row per node
    pub fn create_run(&self, new: &NewRun<'_>) -> StoreResult<()> {
        let plan = new.plan;
        let order: Vec<String> = plan.nodes.iter().map(|n| n.id.clone()).collect();
        let mut summary =
            RunSummary::planned(&plan.run_id, order, format_ts(new.created_at_ns));
        summary.status = RunStatus::Running;
        let plan_json = serde_json::to_string(plan)?;
        let selector_json = serde_json::to_string(&plan.selector)?;
        let summary_json = serde_json::to_string(&summary)?;
        let op = new.operator;

        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO ktl_stack_runs (
              run_id, stack_root, stack_name, profile, command, concurrency, fail_mode, status,
              created_at_ns, updated_at_ns, completed_at_ns, created_by, host, pid,
              ci_run_url, git_author, kubeconfig, kube_context,
              selector_json, plan_json, summary_json, last_event_digest, run_digest
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, 0, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, '', '')
            "#,
            params![
                plan.run_id,
                plan.stack_root.to_string_lossy(),
                plan.stack_name,
                plan.profile,
                plan.command,
                plan.concurrency as i64,
                plan.fail_mode,
                RunStatus::Running.as_str(),
                new.created_at_ns,
                op.created_by,
                op.host,
                op.pid as i64,
                op.ci_run_url,
                op.git_author,
                new.kubeconfig.trim(),
                new.kube_context.trim(),
                selector_json,
                plan_json,
                summary_json,
            ],
        )?;
        for node in &plan.nodes {
            tx.execute(
                "INSERT INTO ktl_stack_nodes (run_id, node_id, status, attempt, error, updated_at_ns) \
                 VALUES (?1, ?2, ?3, 0, '', ?4)",
                params![
                    plan.run_id,
                    node.id,
                    NodeStatus::Planned.as_str(),
                    new.created_at_ns
                ],
            )?;
        }
        tx.commit()?;
        tracing::debug!(run_id = %plan.run_id, nodes = plan.nodes.len(), "run created");
        Ok(())
    }

    /// Chain, digest and persist one event in a single transaction
    ///
    /// Assigns `seq`, `prev_digest`, `digest` and `crc32` on `ev`.
    pub fn append_event(&self, ev: &mut RunEvent) -> StoreResult<()> {
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;

        let last: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, digest FROM ktl_stack_events WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                params![ev.run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (last_seq, prev_digest) = last.unwrap_or_default();

        ev.node_id = ev.node_id.trim().to_string();
        ev.message = ev.message.trim().to_string();
        ev.seq = last_seq.max(0) as u64 + 1;
        ev.prev_digest = prev_digest;
        let (digest, crc) = compute_event_integrity(ev);
        ev.digest = digest;
        ev.crc32 = crc;

        let fields_json = if ev.fields.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&ev.fields)?
        };
        let (err_class, err_msg, err_digest) = match &ev.error {
            Some(e) => (e.class.trim(), e.message.trim(), e.digest.trim()),
            None => ("", "", ""),
        };

        tx.execute(
            r#"
            INSERT INTO ktl_stack_events (
              run_id, ts_ns, node_id, type, attempt, message, fields_json,
              error_class, error_message, error_digest, seq, prev_digest, digest, crc32
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                ev.run_id,
                ev.ts_ns,
                ev.node_id,
                ev.event_type.as_str(),
                ev.attempt as i64,
                ev.message,
                fields_json,
                err_class,
                err_msg,
                err_digest,
                ev.seq as i64,
                ev.prev_digest,
                ev.digest,
                ev.crc32,
            ],
        )?;

        let now = now_ns();
        tx.execute(
            "UPDATE ktl_stack_runs SET updated_at_ns = ?1, last_event_digest = ?2 WHERE run_id = ?3",
            params![now, ev.digest, ev.run_id],
        )?;

        if let Some(status) = node_status_for(ev.event_type) {
            if !ev.node_id.is_empty() {
                let failed = status == NodeStatus::Failed;
                tx.execute(
                    r#"
                    UPDATE ktl_stack_nodes
                    SET status = ?1,
                        attempt = CASE WHEN ?2 > attempt THEN ?2 ELSE attempt END,
                        error = ?3, last_error_class = ?4, last_error_digest = ?5, updated_at_ns = ?6
                    WHERE run_id = ?7 AND node_id = ?8
                    "#,
                    params![
                        status.as_str(),
                        ev.attempt as i64,
                        if failed { err_msg } else { "" },
                        if failed { err_class } else { "" },
                        if failed { err_digest } else { "" },
                        now,
                        ev.run_id,
                        ev.node_id,
                    ],
                )?;
            }
        }

        if ev.event_type == EventType::RunCompleted {
            let status = if ev.message.is_empty() {
                "completed"
            } else {
                ev.message.as_str()
            };
            tx.execute(
                "UPDATE ktl_stack_runs SET status = ?1 WHERE run_id = ?2",
                params![status, ev.run_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Persist the materialized summary and mirror it onto the node rows
    pub fn write_summary(&self, run_id: &str, summary: &RunSummary) -> StoreResult<()> {
        let raw = serde_json::to_string(summary)?;
        let now = now_ns();
        let mut conn = self.writable()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE ktl_stack_runs SET summary_json = ?1, status = ?2, updated_at_ns = ?3 WHERE run_id = ?4",
            params![raw, summary.status.as_str(), now, run_id],
        )?;
        if updated == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        for (node_id, ns) in &summary.nodes {
            tx.execute(
                "UPDATE ktl_stack_nodes SET status = ?1, attempt = ?2, error = ?3, updated_at_ns = ?4 \
                 WHERE run_id = ?5 AND node_id = ?6",
                params![
                    ns.status.as_str(),
                    ns.attempt as i64,
                    ns.error.trim(),
                    now,
                    run_id,
                    node_id
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Stamp completion time and the run digest; returns the digest
    pub fn finalize_run(&self, run_id: &str, completed_at_ns: i64) -> StoreResult<String> {
        let completed_at_ns = if completed_at_ns > 0 {
            completed_at_ns
        } else {
            now_ns()
        };
        let conn = self.writable()?;
        let (plan_json, summary_json, last): (String, String, String) = conn
            .query_row(
                "SELECT plan_json, summary_json, last_event_digest FROM ktl_stack_runs WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        let digest = compute_run_digest(&plan_json, &summary_json, &last);
        conn.execute(
            r#"
            UPDATE ktl_stack_runs
            SET completed_at_ns = ?1, run_digest = ?2,
                updated_at_ns = CASE WHEN updated_at_ns < ?1 THEN ?1 ELSE updated_at_ns END
            WHERE run_id = ?3
            "#,
            params![completed_at_ns, digest, run_id],
        )?;
        tracing::debug!(run_id = %run_id, digest = %digest, "run finalized");
        Ok(digest)
    }

    pub fn get_run(&self, run_id: &str) -> StoreResult<RunRecord> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT run_id, stack_root, stack_name, profile, command, concurrency, fail_mode, status,
                   created_at_ns, updated_at_ns, completed_at_ns, created_by, host, pid,
                   ci_run_url, git_author, kubeconfig, kube_context,
                   selector_json, plan_json, summary_json, last_event_digest, run_digest
            FROM ktl_stack_runs WHERE run_id = ?1
            "#,
            params![run_id],
            |row| {
                Ok(RunRecord {
                    run_id: row.get(0)?,
                    stack_root: row.get(1)?,
                    stack_name: row.get(2)?,
                    profile: row.get(3)?,
                    command: row.get(4)?,
                    concurrency: row.get(5)?,
                    fail_mode: row.get(6)?,
                    status: row.get(7)?,
                    created_at_ns: row.get(8)?,
                    updated_at_ns: row.get(9)?,
                    completed_at_ns: row.get(10)?,
                    operator: OperatorMeta {
                        created_by: row.get(11)?,
                        host: row.get(12)?,
                        pid: row.get::<_, i64>(13)?.max(0) as u32,
                        ci_run_url: row.get(14)?,
                        git_author: row.get(15)?,
                    },
                    kubeconfig: row.get(16)?,
                    kube_context: row.get(17)?,
                    selector_json: row.get(18)?,
                    plan_json: row.get(19)?,
                    summary_json: row.get(20)?,
                    last_event_digest: row.get(21)?,
                    run_digest: row.get(22)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    pub fn get_run_plan(&self, run_id: &str) -> StoreResult<RunPlan> {
        let raw = self.run_column(run_id, "plan_json")?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn get_run_summary(&self, run_id: &str) -> StoreResult<RunSummary> {
        let raw = self.run_column(run_id, "summary_json")?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn run_column(&self, run_id: &str, column: &str) -> StoreResult<String> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM ktl_stack_runs WHERE run_id = ?1", column),
            params![run_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))
    }

    pub fn most_recent_run_id(&self) -> StoreResult<String> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT run_id FROM ktl_stack_runs ORDER BY created_at_ns DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NoRuns(self.path.display().to_string()))
    }

    /// Newest first
    pub fn list_runs(&self, limit: usize) -> StoreResult<Vec<RunListEntry>> {
        let limit = if limit == 0 { 20 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, command, status, created_at_ns, summary_json FROM ktl_stack_runs \
             ORDER BY created_at_ns DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let raw: String = row.get(4)?;
            Ok(RunListEntry {
                run_id: row.get(0)?,
                command: row.get(1)?,
                status: row.get(2)?,
                created_at: format_ts(row.get(3)?),
                totals: serde_json::from_str::<RunSummary>(&raw)
                    .ok()
                    .map(|s| s.totals),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ------------------------------------------------------------------
    // nodes and events
    // ------------------------------------------------------------------

    pub fn get_node_status(&self, run_id: &str) -> StoreResult<BTreeMap<String, NodeState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT node_id, status, attempt, error FROM ktl_stack_nodes WHERE run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let status: String = row.get(1)?;
            Ok((
                row.get::<_, String>(0)?,
                NodeState {
                    status: NodeStatus::parse(&status).unwrap_or(NodeStatus::Planned),
                    attempt: row.get::<_, i64>(2)?.max(0) as u32,
                    error: row.get(3)?,
                },
            ))
        })?;
        Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
    }

    /// Events in Seq order; a non-zero `limit` keeps only the tail
    pub fn list_events(&self, run_id: &str, limit: usize) -> StoreResult<Vec<RunEvent>> {
        let conn = self.conn()?;
        let mut events = if limit == 0 {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM ktl_stack_events WHERE run_id = ?1 ORDER BY id ASC",
                EVENT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![run_id], |row| row_to_event(run_id, row))?;
            rows.collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM ktl_stack_events WHERE run_id = ?1 ORDER BY id DESC LIMIT ?2",
                EVENT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![run_id, limit as i64], |row| {
                row_to_event(run_id, row)
            })?;
            let mut tail = rows.collect::<Result<Vec<_>, _>>()?;
            tail.reverse();
            tail
        };
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    /// Events with Seq greater than `after_seq`, oldest first
    pub fn events_after(
        &self,
        run_id: &str,
        after_seq: u64,
        limit: usize,
    ) -> StoreResult<Vec<RunEvent>> {
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM ktl_stack_events WHERE run_id = ?1 AND seq > ?2 ORDER BY id ASC LIMIT ?3",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![run_id, after_seq as i64, limit], |row| {
            row_to_event(run_id, row)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Recompute the hash chain and compare its tail with the run row
    pub fn verify_events_integrity(&self, run_id: &str) -> StoreResult<()> {
        let record = self.get_run(run_id)?;
        let events = self.list_events(run_id, 0)?;
        verify_chain(&events).map_err(StoreError::Integrity)?;
        let tail = events.last().map(|e| e.digest.as_str()).unwrap_or_default();
        let stored = record.last_event_digest.trim();
        if stored != tail {
            return Err(StoreError::Integrity(format!(
                "stored last_event_digest {:?} does not match last event digest {:?}",
                stored, tail
            )));
        }
        Ok(())
    }

    /// NODE_FAILED events grouped by error class and digest
    pub fn failure_clusters(&self, run_id: &str, limit: usize) -> StoreResult<Vec<FailureCluster>> {
        let limit = if limit == 0 { 5 } else { limit };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT error_class, error_digest, MIN(error_message),
                   COUNT(*) AS failed_events, COUNT(DISTINCT node_id) AS affected_nodes
            FROM ktl_stack_events
            WHERE run_id = ?1 AND type = 'NODE_FAILED' AND node_id != '' AND error_digest != ''
            GROUP BY error_class, error_digest
            ORDER BY affected_nodes DESC, failed_events DESC, error_class ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![run_id, limit as i64], |row| {
            Ok(FailureCluster {
                error_class: row.get(0)?,
                error_digest: row.get(1)?,
                message: row.get(2)?,
                failed_events: row.get::<_, i64>(3)?.max(0) as usize,
                affected_nodes: row.get::<_, i64>(4)?.max(0) as usize,
                example_node_ids: Vec::new(),
            })
        })?;
        let mut clusters = rows.collect::<Result<Vec<_>, _>>()?;

        let mut examples = conn.prepare(
            "SELECT DISTINCT node_id FROM ktl_stack_events \
             WHERE run_id = ?1 AND type = 'NODE_FAILED' AND error_class = ?2 AND error_digest = ?3 \
             ORDER BY node_id ASC LIMIT 5",
        )?;
        for c in &mut clusters {
            let ids = examples.query_map(params![run_id, c.error_class, c.error_digest], |row| {
                row.get::<_, String>(0)
            })?;
            c.example_node_ids = ids.collect::<Result<Vec<_>, _>>()?;
        }
        Ok(clusters)
    }
}

fn node_status_for(event_type: EventType) -> Option<NodeStatus> {
    match event_type {
        EventType::NodeRunning => Some(NodeStatus::Running),
        EventType::NodeSucceeded => Some(NodeStatus::Succeeded),
        EventType::NodeFailed => Some(NodeStatus::Failed),
        EventType::NodeBlocked => Some(NodeStatus::Blocked),
        _ => None,
    }
}

fn row_to_event(run_id: &str, row: &Row<'_>) -> rusqlite::Result<RunEvent> {
    let type_str: String = row.get(3)?;
    let event_type = EventType::parse(type_str.trim()).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown event type {:?}", type_str).into(),
        )
    })?;
    let fields_json: String = row.get(6)?;
    // fields sit outside the digest, so a corrupt value is reported and dropped
    let fields = if fields_json.trim().is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_str(&fields_json).unwrap_or_else(|err| {
            let seq: i64 = row.get(10).unwrap_or_default();
            tracing::warn!(run_id = %run_id, seq, error = %err, "discarding unreadable event fields");
            BTreeMap::new()
        })
    };
    let err_class: String = row.get(7)?;
    let err_message: String = row.get(8)?;
    let err_digest: String = row.get(9)?;
    let error = if err_class.trim().is_empty()
        && err_message.trim().is_empty()
        && err_digest.trim().is_empty()
    {
        None
    } else {
        Some(RunError {
            class: err_class.trim().to_string(),
            message: err_message.trim().to_string(),
            digest: err_digest.trim().to_string(),
        })
    };
    Ok(RunEvent {
        seq: row.get::<_, i64>(10)?.max(0) as u64,
        ts_ns: row.get(1)?,
        run_id: run_id.to_string(),
        node_id: row.get::<_, String>(2)?.trim().to_string(),
        event_type,
        attempt: row.get::<_, i64>(4)?.max(0) as u32,
        message: row.get::<_, String>(5)?.trim().to_string(),
        fields,
        error,
        prev_digest: row.get::<_, String>(11)?.trim().to_string(),
        digest: row.get::<_, String>(12)?.trim().to_string(),
        crc32: row.get::<_, String>(13)?.trim().to_string(),
    })
}
