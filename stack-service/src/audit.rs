// Run Audit
// Read-only report over a recorded run, with optional integrity verification

use crate::error::StackResult;
use crate::execution::{format_ts, RunEvent};
use crate::state::{compute_run_digest, FailureCluster, RunPlan, RunSummary, StateStore};

use serde::Serialize;
use std::path::{Path, PathBuf};

pub const AUDIT_API_VERSION: &str = "ktl.dev/stack-audit/v1";

/// Events returned when no limit is given
pub const DEFAULT_EVENTS_LIMIT: usize = 1000;

const FAILURE_CLUSTER_LIMIT: usize = 5;

#[derive(Debug, Clone)]
pub struct AuditOptions {
    pub root: PathBuf,
    /// Empty selects the most recent run
    pub run_id: String,
    pub verify: bool,
    pub events_limit: usize,
    pub include_plan: bool,
    pub include_events: bool,
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            run_id: String::new(),
            verify: false,
            events_limit: DEFAULT_EVENTS_LIMIT,
            include_plan: false,
            include_events: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunIntegrity {
    pub events_ok: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub events_error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_event_digest: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stored_last_digest: String,
    pub run_digest_ok: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_digest_expected: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_digest_stored: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_digest_error: String,
}

impl RunIntegrity {
    pub fn ok(&self) -> bool {
        self.events_ok && self.run_digest_ok
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAudit {
    pub api_version: String,
    pub run_id: String,
    pub stack_root: String,
    pub stack_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub profile: String,
    pub command: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub completed_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub pid: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ci_run_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_author: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kubeconfig: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kube_context: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plan_hash: String,
    pub follow_command: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub run_digest: String,
    /// Present only when verification was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<RunIntegrity>,
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failure_clusters: Vec<FailureCluster>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<RunPlan>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<RunEvent>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// `ktl stack status` invocation that tails this run
pub fn follow_command(root: &Path, run_id: &str) -> String {
    let root = root.to_string_lossy();
    let root = root.trim();
    if root.is_empty() || root == "." {
        format!("ktl stack status --run-id {} --follow", run_id)
    } else {
        format!("ktl stack --root {} status --run-id {} --follow", root, run_id)
    }
}

/// Open the state store under `opts.root` read-only and audit one run
pub fn load_audit(opts: &AuditOptions) -> StackResult<RunAudit> {
    let store = StateStore::open_read_only(&opts.root)?;
    audit_run(&store, opts)
}

/// Build the audit report for a run
///
/// Integrity problems are reported in `integrity`, never as an error, so a
/// tampered run still yields everything that could be read.
pub fn audit_run(store: &StateStore, opts: &AuditOptions) -> StackResult<RunAudit> {
    let run_id = match opts.run_id.trim() {
        "" => store.most_recent_run_id()?,
        id => id.to_string(),
    };
    let record = store.get_run(&run_id)?;
    let summary: RunSummary = serde_json::from_str(&record.summary_json)
        .map_err(crate::state::StoreError::from)?;
    let plan: Option<RunPlan> = serde_json::from_str(&record.plan_json).ok();

    let failure_clusters = match store.failure_clusters(&run_id, FAILURE_CLUSTER_LIMIT) {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(run_id = %run_id, error = %err, "failure clusters unavailable");
            Vec::new()
        }
    };
    let events = if opts.include_events {
        let limit = if opts.events_limit == 0 {
            DEFAULT_EVENTS_LIMIT
        } else {
            opts.events_limit
        };
        store.list_events(&run_id, limit)?
    } else {
        Vec::new()
    };
    let integrity = opts.verify.then(|| verify_run(store, &run_id, &record));

    Ok(RunAudit {
        api_version: AUDIT_API_VERSION.to_string(),
        follow_command: follow_command(&opts.root, &run_id),
        run_id,
        stack_root: record.stack_root,
        stack_name: record.stack_name,
        profile: record.profile,
        command: record.command,
        status: record.status.trim().to_string(),
        created_at: format_ts(record.created_at_ns),
        updated_at: format_ts(record.updated_at_ns),
        completed_at: if record.completed_at_ns > 0 {
            format_ts(record.completed_at_ns)
        } else {
            String::new()
        },
        created_by: record.operator.created_by,
        host: record.operator.host,
        pid: record.operator.pid,
        ci_run_url: record.operator.ci_run_url,
        git_author: record.operator.git_author,
        kubeconfig: record.kubeconfig,
        kube_context: record.kube_context,
        state_path: store.path().display().to_string(),
        plan_hash: plan.as_ref().map(|p| p.plan_hash.clone()).unwrap_or_default(),
        run_digest: record.run_digest.trim().to_string(),
        integrity,
        summary,
        failure_clusters,
        plan: if opts.include_plan { plan } else { None },
        events,
    })
}

fn verify_run(store: &StateStore, run_id: &str, record: &crate::state::RunRecord) -> RunIntegrity {
    let mut integrity = RunIntegrity {
        events_ok: true,
        run_digest_ok: true,
        stored_last_digest: record.last_event_digest.trim().to_string(),
        ..Default::default()
    };

    if let Err(err) = store.verify_events_integrity(run_id) {
        integrity.events_ok = false;
        integrity.events_error = err.to_string();
    }
    match store.list_events(run_id, 1) {
        Ok(tail) => {
            integrity.last_event_digest = tail
                .last()
                .map(|e| e.digest.trim().to_string())
                .unwrap_or_default();
        }
        Err(err) => {
            integrity.events_ok = false;
            integrity.events_error = format!("read last event digest: {}", err);
        }
    }

    let last = if integrity.last_event_digest.is_empty() {
        integrity.stored_last_digest.as_str()
    } else {
        integrity.last_event_digest.as_str()
    };
    let expected = compute_run_digest(&record.plan_json, &record.summary_json, last);
    integrity.run_digest_stored = record.run_digest.trim().to_string();
    if integrity.run_digest_stored.is_empty() {
        integrity.run_digest_ok = false;
        integrity.run_digest_error = "missing run_digest (run may predate digest support)".into();
    } else if integrity.run_digest_stored != expected {
        integrity.run_digest_ok = false;
        integrity.run_digest_error = "run_digest mismatch".into();
    }
    integrity.run_digest_expected = expected;
    if !integrity.ok() {
        tracing::warn!(run_id = %run_id, events = %integrity.events_error, digest = %integrity.run_digest_error, "run failed verification");
    }
    integrity
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailMode, HooksConfig, StackCommand};
    use crate::execution::testing::{release, FakeBackend, ScriptedHookRunner};
    use crate::execution::{Coordinator, RunOptions};
    use crate::stack::Plan;
    use crate::state::OperatorMeta;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn record_failed_run(root: &Path) -> String {
        let store = Arc::new(StateStore::open(root).unwrap());
        let backend = Arc::new(FakeBackend::default());
        backend.fail("c/ns/a", 1, false);
        backend.fail("c/ns/b", 1, false);
        let plan = Plan::new(
            root.to_path_buf(),
            "demo".into(),
            String::new(),
            vec![
                release("c", "ns", "a", &[]),
                release("c", "ns", "b", &[]),
                release("c", "ns", "ok", &[]),
            ],
            HooksConfig::default(),
        );
        let mut opts = RunOptions::new(StackCommand::Apply);
        opts.run_id = "audit-run".into();
        opts.concurrency = 1;
        opts.fail_mode = FailMode::Continue;
        opts.operator = Some(OperatorMeta {
            created_by: "ci".into(),
            ..Default::default()
        });
        let outcome = Coordinator::new(backend, Arc::new(ScriptedHookRunner::default()))
            .with_store(store)
            .run(&plan, opts)
            .await
            .unwrap();
        outcome.run_id
    }

    fn tamper(root: &Path, sql: &str) {
        let conn = rusqlite::Connection::open(StateStore::db_path(root)).unwrap();
        conn.execute(sql, []).unwrap();
    }

    #[tokio::test]
    async fn test_verified_audit_of_failed_run() {
        let dir = TempDir::new().unwrap();
        let run_id = record_failed_run(dir.path()).await;

        let audit = load_audit(&AuditOptions {
            root: dir.path().to_path_buf(),
            verify: true,
            include_events: true,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(audit.api_version, AUDIT_API_VERSION);
        assert_eq!(audit.run_id, run_id);
        assert_eq!(audit.status, "failed");
        assert_eq!(audit.created_by, "ci");
        assert!(audit.integrity.as_ref().unwrap().ok());
        assert_eq!(audit.summary.totals.failed, 2);
        assert_eq!(audit.failure_clusters.len(), 2);
        assert_eq!(audit.failure_clusters[0].affected_nodes, 1);
        assert!(!audit.events.is_empty());
        assert!(audit.plan.is_none());
        assert!(audit.follow_command.ends_with("status --run-id audit-run --follow"));
    }

    #[tokio::test]
    async fn test_tampered_summary_reports_digest_mismatch() {
        let dir = TempDir::new().unwrap();
        let run_id = record_failed_run(dir.path()).await;
        tamper(
            dir.path(),
            r#"UPDATE ktl_stack_runs SET summary_json = replace(summary_json, '"status":"failed"', '"status":"succeeded"')"#,
        );

        let audit = load_audit(&AuditOptions {
            root: dir.path().to_path_buf(),
            run_id,
            verify: true,
            ..Default::default()
        })
        .unwrap();
        let integrity = audit.integrity.unwrap();
        assert!(integrity.events_ok);
        assert!(!integrity.run_digest_ok);
        assert_eq!(integrity.run_digest_error, "run_digest mismatch");
    }

    #[tokio::test]
    async fn test_missing_digest_and_broken_chain() {
        let dir = TempDir::new().unwrap();
        let run_id = record_failed_run(dir.path()).await;
        tamper(dir.path(), "UPDATE ktl_stack_runs SET run_digest = ''");
        tamper(
            dir.path(),
            "UPDATE ktl_stack_events SET message = 'edited' WHERE seq = 2",
        );

        let audit = load_audit(&AuditOptions {
            root: dir.path().to_path_buf(),
            run_id,
            verify: true,
            include_plan: true,
            ..Default::default()
        })
        .unwrap();
        let integrity = audit.integrity.unwrap();
        assert!(!integrity.events_ok);
        assert!(!integrity.events_error.is_empty());
        assert_eq!(
            integrity.run_digest_error,
            "missing run_digest (run may predate digest support)"
        );
        assert!(audit.plan.is_some());
    }

    #[test]
    fn test_follow_command_includes_non_default_root() {
        assert_eq!(
            follow_command(Path::new("."), "r1"),
            "ktl stack status --run-id r1 --follow"
        );
        assert_eq!(
            follow_command(Path::new("/srv/stack"), "r1"),
            "ktl stack --root /srv/stack status --run-id r1 --follow"
        );
    }
}
