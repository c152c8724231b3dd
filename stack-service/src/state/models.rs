// Persisted run models
// Run plan, summary and row types stored in the state database

use super::integrity::compute_plan_hash;
use super::lock::default_lock_owner;
use crate::config::{FailMode, HooksConfig, StackCommand};
use crate::stack::git::git_identity;
use crate::stack::{Plan, ResolvedRelease, RunSelector, TOOL_VERSION};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const RUN_PLAN_API_VERSION: &str = "ktl.dev/stack-run/v1";

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "created" => Some(RunStatus::Created),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Planned,
    Queued,
    Running,
    Succeeded,
    Failed,
    Blocked,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Planned => "planned",
            NodeStatus::Queued => "queued",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "planned" => Some(NodeStatus::Planned),
            "queued" => Some(NodeStatus::Queued),
            "running" => Some(NodeStatus::Running),
            "succeeded" => Some(NodeStatus::Succeeded),
            "failed" => Some(NodeStatus::Failed),
            "blocked" => Some(NodeStatus::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted form of a plan, hashed for tamper evidence and resume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunPlan {
    pub api_version: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub plan_hash: String,
    pub stack_root: PathBuf,
    pub stack_name: String,
    pub command: String,
    pub profile: String,
    pub concurrency: usize,
    pub fail_mode: String,
    pub selector: RunSelector,
    pub nodes: Vec<ResolvedRelease>,
    #[serde(skip_serializing_if = "HooksConfig::is_empty")]
    pub stack_hooks: HooksConfig,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stack_git_commit: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stack_git_dirty: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ktl_version: String,
}

impl RunPlan {
    /// Snapshot `plan` for `run_id` and stamp provenance and the plan hash
    pub fn build(
        run_id: &str,
        plan: &Plan,
        command: StackCommand,
        concurrency: usize,
        fail_mode: FailMode,
        selector: &RunSelector,
    ) -> Result<Self, serde_json::Error> {
        let git = git_identity(&plan.stack_root);
        let mut rp = RunPlan {
            api_version: RUN_PLAN_API_VERSION.to_string(),
            run_id: run_id.to_string(),
            plan_hash: String::new(),
            stack_root: plan.stack_root.clone(),
            stack_name: plan.stack_name.clone(),
            command: command.as_str().to_string(),
            profile: plan.profile.clone(),
            concurrency,
            fail_mode: fail_mode.as_str().to_string(),
            selector: selector.clone(),
            nodes: plan.nodes.clone(),
            stack_hooks: plan.stack_hooks.clone(),
            stack_git_commit: git.commit,
            stack_git_dirty: git.dirty,
            ktl_version: TOOL_VERSION.to_string(),
        };
        rp.plan_hash = compute_plan_hash(&rp)?;
        Ok(rp)
    }

    /// Rebuild the in-memory plan this run executed
    pub fn to_plan(&self) -> Plan {
        Plan::new(
            self.stack_root.clone(),
            self.stack_name.clone(),
            self.profile.clone(),
            self.nodes.clone(),
            self.stack_hooks.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTotals {
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub blocked: usize,
    pub running: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Materialized view of the event log at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub api_version: String,
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: String,
    pub updated_at: String,
    pub totals: RunTotals,
    pub nodes: BTreeMap<String, NodeSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
}

impl RunSummary {
    /// Summary of a run that has not started any node yet
    pub fn planned(run_id: &str, order: Vec<String>, started_at: String) -> Self {
        let nodes = order
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    NodeSummary {
                        status: NodeStatus::Planned,
                        attempt: 0,
                        error: String::new(),
                    },
                )
            })
            .collect();
        Self {
            api_version: RUN_PLAN_API_VERSION.to_string(),
            run_id: run_id.to_string(),
            status: RunStatus::Created,
            updated_at: started_at.clone(),
            started_at,
            totals: RunTotals {
                planned: order.len(),
                ..Default::default()
            },
            nodes,
            order,
        }
    }

    /// Recount totals from the node map
    pub fn recount(&mut self) {
        let mut totals = RunTotals {
            planned: self.nodes.len(),
            ..Default::default()
        };
        for n in self.nodes.values() {
            match n.status {
                NodeStatus::Succeeded => totals.succeeded += 1,
                NodeStatus::Failed => totals.failed += 1,
                NodeStatus::Blocked => totals.blocked += 1,
                NodeStatus::Running => totals.running += 1,
                NodeStatus::Planned | NodeStatus::Queued => {}
            }
        }
        self.totals = totals;
    }
}

/// Who started a run and from where
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorMeta {
    pub created_by: String,
    pub host: String,
    pub pid: u32,
    pub ci_run_url: String,
    pub git_author: String,
}

impl OperatorMeta {
    pub fn detect(stack_root: &Path) -> Self {
        Self {
            created_by: default_lock_owner(),
            host: host_name(),
            pid: std::process::id(),
            ci_run_url: ci_run_url_from_env(),
            git_author: git_author(stack_root),
        }
    }
}

pub(crate) fn host_name() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Link back to the CI job that launched this process, if any
pub fn ci_run_url_from_env() -> String {
    let var = |k: &str| std::env::var(k).unwrap_or_default().trim().to_string();
    let (server, repo, run) = (
        var("GITHUB_SERVER_URL"),
        var("GITHUB_REPOSITORY"),
        var("GITHUB_RUN_ID"),
    );
    if !server.is_empty() && !repo.is_empty() && !run.is_empty() {
        return format!("{}/{}/actions/runs/{}", server, repo, run);
    }
    for key in ["CI_JOB_URL", "BUILD_URL", "BUILDKITE_BUILD_URL"] {
        let v = var(key);
        if !v.is_empty() {
            return v;
        }
    }
    String::new()
}

fn git_author(root: &Path) -> String {
    std::process::Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["log", "-1", "--format=%an <%ae>"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default()
}

/// Fields needed to insert a new run row
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub plan: &'a RunPlan,
    pub operator: &'a OperatorMeta,
    pub kubeconfig: &'a str,
    pub kube_context: &'a str,
    pub created_at_ns: i64,
}

/// One row of `ktl_stack_runs`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub stack_root: String,
    pub stack_name: String,
    pub profile: String,
    pub command: String,
    pub concurrency: i64,
    pub fail_mode: String,
    pub status: String,
    pub created_at_ns: i64,
    pub updated_at_ns: i64,
    pub completed_at_ns: i64,
    pub operator: OperatorMeta,
    pub kubeconfig: String,
    pub kube_context: String,
    pub selector_json: String,
    pub plan_json: String,
    pub summary_json: String,
    pub last_event_digest: String,
    pub run_digest: String,
}

/// Current state of one node in `ktl_stack_nodes`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub status: NodeStatus,
    pub attempt: u32,
    pub error: String,
}

/// Row of `ktl stack runs`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunListEntry {
    pub run_id: String,
    pub command: String,
    pub status: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals: Option<RunTotals>,
}

/// NODE_FAILED events sharing one root cause
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureCluster {
    pub error_class: String,
    pub error_digest: String,
    /// First message seen for the digest
    pub message: String,
    pub failed_events: usize,
    pub affected_nodes: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub example_node_ids: Vec<String>,
}
