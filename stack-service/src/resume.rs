// Resume
// Reload a recorded run and derive the plan that finishes it

use crate::config::{FailMode, StackCommand};
use crate::error::{StackError, StackResult};
use crate::stack::{drift_report, DriftReport, Plan};
use crate::state::{NodeState, NodeStatus, RunPlan, StateStore};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// A verified run snapshot: its plan plus the last known node states
#[derive(Debug, Clone)]
pub struct LoadedRun {
    pub root: PathBuf,
    pub run_id: String,
    pub run_plan: RunPlan,
    pub plan: Plan,
    pub nodes: BTreeMap<String, NodeState>,
}

impl LoadedRun {
    pub fn command(&self) -> StackResult<StackCommand> {
        StackCommand::parse(&self.run_plan.command).ok_or_else(|| {
            StackError::Validation(format!(
                "run {} has unknown command {:?}",
                self.run_id, self.run_plan.command
            ))
        })
    }

    pub fn fail_mode(&self) -> FailMode {
        FailMode::from_fail_fast(self.run_plan.fail_mode != FailMode::Continue.as_str())
    }

    pub fn status(&self, node_id: &str) -> NodeStatus {
        self.nodes
            .get(node_id)
            .map(|n| n.status)
            .unwrap_or(NodeStatus::Planned)
    }

    /// Attempts already spent, so a resumed run keeps counting
    pub fn attempts(&self) -> BTreeMap<String, u32> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.attempt > 0)
            .map(|(id, n)| (id.clone(), n.attempt))
            .collect()
    }

    /// Compare stored input hashes against a fresh compile of the stack
    pub fn drift(&self, current: &Plan) -> DriftReport {
        drift_report(&self.plan.nodes, current)
    }
}

/// Open the store under `root` and load `run_id` (empty = most recent)
pub fn load_run(root: &Path, run_id: &str) -> StackResult<LoadedRun> {
    let store = StateStore::open_read_only(root)?;
    load_run_from(&store, root, run_id)
}

/// Load a run after verifying its event chain
///
/// A tampered run is refused. The stack root is rebased onto `root` so a
/// copied state directory still resolves charts and values locally.
pub fn load_run_from(store: &StateStore, root: &Path, run_id: &str) -> StackResult<LoadedRun> {
    let run_id = match run_id.trim() {
        "" => store.most_recent_run_id()?,
        id => id.to_string(),
    };
    store.verify_events_integrity(&run_id).map_err(|err| {
        StackError::Integrity(format!("run {} events integrity: {}", run_id, err))
    })?;
    let mut run_plan = store.get_run_plan(&run_id)?;
    run_plan.stack_root = root.to_path_buf();
    let plan = run_plan.to_plan();
    let nodes = store.get_node_status(&run_id)?;
    tracing::debug!(run_id = %run_id, nodes = nodes.len(), "run loaded");
    Ok(LoadedRun {
        root: root.to_path_buf(),
        run_id,
        run_plan,
        plan,
        nodes,
    })
}

/// Nodes still to do, as a plan of their own
///
/// Succeeded nodes are never re-run. With `rerun_failed` only the nodes that
/// failed are scheduled. Dependencies on nodes outside the new plan are
/// dropped since they are either done or deliberately left out.
pub fn resume_plan(loaded: &LoadedRun, rerun_failed: bool) -> Plan {
    let keep: BTreeSet<String> = loaded
        .plan
        .nodes
        .iter()
        .filter(|n| match loaded.status(&n.id) {
            NodeStatus::Succeeded => false,
            NodeStatus::Failed => true,
            _ => !rerun_failed,
        })
        .map(|n| n.id.clone())
        .collect();

    let mut plan = loaded.plan.retain_ids(&keep);
    for node in &mut plan.nodes {
        node.needs.retain(|need| keep.contains(need));
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HooksConfig;
    use crate::execution::testing::{release, FakeBackend, ScriptedHookRunner};
    use crate::execution::{Coordinator, RunOptions};
    use crate::state::OperatorMeta;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn stack(root: &Path) -> Plan {
        Plan::new(
            root.to_path_buf(),
            "demo".into(),
            String::new(),
            vec![
                release("c", "ns", "db", &[]),
                release("c", "ns", "api", &["c/ns/db"]),
                release("c", "ns", "web", &["c/ns/api"]),
                release("c", "ns", "cron", &[]),
            ],
            HooksConfig::default(),
        )
    }

    async fn failed_run(root: &Path) -> String {
        let store = Arc::new(StateStore::open(root).unwrap());
        let backend = Arc::new(FakeBackend::default());
        backend.fail("c/ns/api", 1, false);
        let mut opts = RunOptions::new(StackCommand::Apply);
        opts.run_id = "first".into();
        opts.concurrency = 1;
        opts.fail_mode = FailMode::Continue;
        opts.operator = Some(OperatorMeta::default());
        Coordinator::new(backend, Arc::new(ScriptedHookRunner::default()))
            .with_store(store)
            .run(&stack(root), opts)
            .await
            .unwrap()
            .run_id
    }

    #[tokio::test]
    async fn test_resume_plan_skips_succeeded_nodes() {
        let dir = TempDir::new().unwrap();
        let run_id = failed_run(dir.path()).await;

        let loaded = load_run(dir.path(), "").unwrap();
        assert_eq!(loaded.run_id, run_id);
        assert_eq!(loaded.command().unwrap(), StackCommand::Apply);
        assert_eq!(loaded.fail_mode(), FailMode::Continue);
        assert_eq!(loaded.status("c/ns/api"), NodeStatus::Failed);
        assert_eq!(loaded.status("c/ns/web"), NodeStatus::Blocked);
        assert_eq!(loaded.attempts().get("c/ns/api"), Some(&1));

        let plan = resume_plan(&loaded, false);
        assert_eq!(plan.node_ids(), vec!["c/ns/api", "c/ns/web"]);
        assert!(plan.node("c/ns/api").unwrap().needs.is_empty());
        assert_eq!(plan.node("c/ns/web").unwrap().needs, vec!["c/ns/api"]);

        let failed_only = resume_plan(&loaded, true);
        assert_eq!(failed_only.node_ids(), vec!["c/ns/api"]);
    }

    #[tokio::test]
    async fn test_resumed_run_continues_attempt_count() {
        let dir = TempDir::new().unwrap();
        failed_run(dir.path()).await;
        let loaded = load_run(dir.path(), "first").unwrap();
        let plan = resume_plan(&loaded, false);

        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let mut opts = RunOptions::new(loaded.command().unwrap());
        opts.run_id = "second".into();
        opts.initial_attempts = loaded.attempts();
        opts.operator = Some(OperatorMeta::default());
        let outcome = Coordinator::new(
            Arc::new(FakeBackend::default()),
            Arc::new(ScriptedHookRunner::default()),
        )
        .with_store(store)
        .run(&plan, opts)
        .await
        .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.summary.nodes["c/ns/api"].attempt, 2);
        assert_eq!(outcome.summary.nodes["c/ns/web"].attempt, 1);
    }

    #[tokio::test]
    async fn test_tampered_run_is_refused() {
        let dir = TempDir::new().unwrap();
        failed_run(dir.path()).await;
        let conn = rusqlite::Connection::open(StateStore::db_path(dir.path())).unwrap();
        conn.execute("DELETE FROM ktl_stack_events WHERE seq = 3", [])
            .unwrap();

        let err = load_run(dir.path(), "first").unwrap_err();
        assert_eq!(err.class(), "INTEGRITY");
    }

    #[tokio::test]
    async fn test_drift_lists_changed_and_removed() {
        let dir = TempDir::new().unwrap();
        failed_run(dir.path()).await;
        let loaded = load_run(dir.path(), "first").unwrap();

        let mut current = stack(dir.path());
        current.nodes.retain(|n| n.name != "cron");
        current.nodes[0].effective_input_hash = "sha256:changed".into();
        current.reindex();

        let drift = loaded.drift(&current);
        assert_eq!(drift.changed.len(), 1);
        assert_eq!(drift.changed[0].node_id, "c/ns/db");
        assert_eq!(drift.removed, vec!["c/ns/cron"]);
    }
}
