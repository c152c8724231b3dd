// Scheduler
// Per-node state machine over the run's dependency edges

use crate::config::{FailMode, StackCommand};
use crate::stack::ResolvedRelease;
use crate::state::NodeStatus;

use std::collections::{BTreeMap, BTreeSet};

/// A node that will never run, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked {
    pub node_id: String,
    pub reason: String,
}

/// Nodes whose state changed as a result of a completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    pub queued: Vec<String>,
    pub blocked: Vec<Blocked>,
}

/// Dependency bookkeeping for one run
///
/// Owned by the coordinator loop; workers report back through it and never
/// touch it directly.
#[derive(Debug)]
pub struct Scheduler {
    order: Vec<String>,
    deps: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
    /// Unfinished dependencies per node
    pending: BTreeMap<String, usize>,
    status: BTreeMap<String, NodeStatus>,
    ready: BTreeSet<String>,
    errors: BTreeMap<String, String>,
    fail_mode: FailMode,
    stopped: bool,
}

impl Scheduler {
    /// Build from plan nodes; delete runs walk the edges in reverse
    ///
    /// `needs` entries outside the node set are ignored.
    pub fn new(nodes: &[ResolvedRelease], command: StackCommand, fail_mode: FailMode) -> Self {
        let ids: BTreeSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in nodes {
            deps.entry(node.id.clone()).or_default();
            dependents.entry(node.id.clone()).or_default();
        }
        for node in nodes {
            for need in node.needs.iter().filter(|n| ids.contains(n.as_str())) {
                let (before, after) = match command {
                    StackCommand::Apply => (need.clone(), node.id.clone()),
                    StackCommand::Delete => (node.id.clone(), need.clone()),
                };
                deps.entry(after.clone()).or_default().push(before.clone());
                dependents.entry(before).or_default().push(after);
            }
        }
        for list in deps.values_mut().chain(dependents.values_mut()) {
            list.sort();
            list.dedup();
        }

        let pending = deps.iter().map(|(id, d)| (id.clone(), d.len())).collect();
        let status = nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Planned))
            .collect();
        Self {
            order: nodes.iter().map(|n| n.id.clone()).collect(),
            deps,
            dependents,
            pending,
            status,
            ready: BTreeSet::new(),
            errors: BTreeMap::new(),
            fail_mode,
            stopped: false,
        }
    }

    /// Queue every node without dependencies; returns them in ID order
    pub fn seed(&mut self) -> Vec<String> {
        let roots: Vec<String> = self
            .pending
            .iter()
            .filter(|(id, n)| **n == 0 && self.status.get(*id) == Some(&NodeStatus::Planned))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &roots {
            self.enqueue(id);
        }
        roots
    }

    fn enqueue(&mut self, id: &str) {
        self.status.insert(id.to_string(), NodeStatus::Queued);
        self.ready.insert(id.to_string());
    }

    /// Ready nodes in the order they should be considered
    pub fn ready(&self) -> impl Iterator<Item = &String> {
        self.ready.iter()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Move a ready node to RUNNING
    pub fn start(&mut self, id: &str) -> bool {
        if self.stopped || !self.ready.remove(id) {
            return false;
        }
        self.status.insert(id.to_string(), NodeStatus::Running);
        true
    }

    pub fn mark_succeeded(&mut self, id: &str) -> Transition {
        let mut t = Transition::default();
        if self.status.get(id) != Some(&NodeStatus::Running) {
            return t;
        }
        self.status.insert(id.to_string(), NodeStatus::Succeeded);
        let dependents = self.dependents.get(id).cloned().unwrap_or_default();
        for dep in dependents {
            let Some(count) = self.pending.get_mut(&dep) else {
                continue;
            };
            *count = count.saturating_sub(1);
            if *count == 0 && self.status.get(&dep) == Some(&NodeStatus::Planned) {
                if self.stopped {
                    continue;
                }
                self.enqueue(&dep);
                t.queued.push(dep);
            }
        }
        t
    }

    /// Record a failure and block what can no longer run
    ///
    /// Transitive dependents are always blocked. Under fail-fast every other
    /// node that has not started is blocked as well.
    pub fn mark_failed(&mut self, id: &str, error: impl Into<String>) -> Transition {
        let mut t = Transition::default();
        if self.status.get(id) != Some(&NodeStatus::Running) {
            return t;
        }
        self.status.insert(id.to_string(), NodeStatus::Failed);
        self.errors.insert(id.to_string(), error.into());
        t.blocked = self.block_dependents(id, "failed");
        if self.fail_mode == FailMode::FailFast {
            self.stopped = true;
            t.blocked.extend(self.block_remaining("fail-fast"));
        }
        t
    }

    fn block_dependents(&mut self, root: &str, root_state: &str) -> Vec<Blocked> {
        let mut out = Vec::new();
        let mut stack = vec![(root.to_string(), root_state.to_string())];
        while let Some((cause, state)) = stack.pop() {
            let dependents = self.dependents.get(&cause).cloned().unwrap_or_default();
            for dep in dependents {
                if !self.is_unstarted(&dep) {
                    continue;
                }
                self.ready.remove(&dep);
                self.status.insert(dep.clone(), NodeStatus::Blocked);
                out.push(Blocked {
                    node_id: dep.clone(),
                    reason: format!("dependency {} {}", cause, state),
                });
                stack.push((dep, "blocked".to_string()));
            }
        }
        out
    }

    fn is_unstarted(&self, id: &str) -> bool {
        matches!(
            self.status.get(id),
            Some(NodeStatus::Planned) | Some(NodeStatus::Queued)
        )
    }

    /// Stop scheduling and block every node that has not started
    pub fn block_remaining(&mut self, reason: &str) -> Vec<Blocked> {
        self.stopped = true;
        self.ready.clear();
        let mut out = Vec::new();
        for id in self.order.clone() {
            if self.is_unstarted(&id) {
                self.status.insert(id.clone(), NodeStatus::Blocked);
                out.push(Blocked {
                    node_id: id,
                    reason: reason.to_string(),
                });
            }
        }
        out
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn running(&self) -> usize {
        self.status
            .values()
            .filter(|s| **s == NodeStatus::Running)
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.status.values().all(NodeStatus::is_terminal)
    }

    /// Nodes left waiting when nothing is ready and nothing is running
    pub fn deadlocked(&self) -> Option<Vec<String>> {
        if !self.ready.is_empty() || self.running() > 0 {
            return None;
        }
        let pending: Vec<String> = self
            .order
            .iter()
            .filter(|id| !self.status.get(*id).is_some_and(NodeStatus::is_terminal))
            .cloned()
            .collect();
        (!pending.is_empty()).then_some(pending)
    }

    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.status.get(id).copied()
    }

    pub fn error(&self, id: &str) -> Option<&str> {
        self.errors.get(id).map(String::as_str)
    }

    pub fn deps(&self, id: &str) -> &[String] {
        self.deps.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn all_succeeded(&self) -> bool {
        self.status.values().all(|s| *s == NodeStatus::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(id: &str, needs: &[&str]) -> ResolvedRelease {
        ResolvedRelease {
            id: id.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn chain() -> Vec<ResolvedRelease> {
        vec![
            node("c/ns/a", &[]),
            node("c/ns/b", &["c/ns/a"]),
            node("c/ns/c", &["c/ns/b"]),
            node("c/ns/d", &[]),
        ]
    }

    #[test]
    fn test_dependencies_gate_readiness() {
        let mut s = Scheduler::new(&chain(), StackCommand::Apply, FailMode::Continue);
        assert_eq!(s.seed(), vec!["c/ns/a", "c/ns/d"]);
        assert!(!s.start("c/ns/b"));
        assert!(s.start("c/ns/a"));
        let t = s.mark_succeeded("c/ns/a");
        assert_eq!(t.queued, vec!["c/ns/b"]);
        assert_eq!(s.status("c/ns/b"), Some(NodeStatus::Queued));
    }

    #[test]
    fn test_delete_reverses_edges() {
        let mut s = Scheduler::new(&chain(), StackCommand::Delete, FailMode::Continue);
        assert_eq!(s.seed(), vec!["c/ns/c", "c/ns/d"]);
        assert_eq!(s.deps("c/ns/a"), &["c/ns/b".to_string()]);
    }

    #[test]
    fn test_continue_mode_blocks_only_dependents() {
        let mut s = Scheduler::new(&chain(), StackCommand::Apply, FailMode::Continue);
        s.seed();
        s.start("c/ns/a");
        let t = s.mark_failed("c/ns/a", "boom");
        assert_eq!(
            t.blocked,
            vec![
                Blocked {
                    node_id: "c/ns/b".into(),
                    reason: "dependency c/ns/a failed".into()
                },
                Blocked {
                    node_id: "c/ns/c".into(),
                    reason: "dependency c/ns/b blocked".into()
                },
            ]
        );
        assert!(s.start("c/ns/d"));
        s.mark_succeeded("c/ns/d");
        assert!(s.all_terminal());
        assert_eq!(s.error("c/ns/a"), Some("boom"));
    }

    #[test]
    fn test_fail_fast_blocks_everything_unstarted() {
        let mut s = Scheduler::new(&chain(), StackCommand::Apply, FailMode::FailFast);
        s.seed();
        s.start("c/ns/a");
        let t = s.mark_failed("c/ns/a", "boom");
        let blocked: Vec<_> = t.blocked.iter().map(|b| b.node_id.as_str()).collect();
        assert_eq!(blocked, vec!["c/ns/b", "c/ns/c", "c/ns/d"]);
        assert_eq!(t.blocked[2].reason, "fail-fast");
        assert!(!s.start("c/ns/d"));
    }

    #[test]
    fn test_cycle_is_reported_as_deadlock() {
        let nodes = vec![node("c/ns/a", &["c/ns/b"]), node("c/ns/b", &["c/ns/a"])];
        let mut s = Scheduler::new(&nodes, StackCommand::Apply, FailMode::FailFast);
        assert!(s.seed().is_empty());
        assert_eq!(
            s.deadlocked(),
            Some(vec!["c/ns/a".to_string(), "c/ns/b".to_string()])
        );
    }

    #[test]
    fn test_missing_needs_are_ignored() {
        let nodes = vec![node("c/ns/b", &["c/ns/gone"])];
        let mut s = Scheduler::new(&nodes, StackCommand::Apply, FailMode::FailFast);
        assert_eq!(s.seed(), vec!["c/ns/b"]);
    }
}
