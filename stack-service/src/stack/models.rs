// Resolved stack model
// Fully merged release nodes and the plan that orders them

use crate::config::{ApplyOptions, ClusterTarget, DeleteOptions, HooksConfig, StackCommand};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One release after defaults, profile and overrides are merged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolvedRelease {
    /// `cluster/namespace/name`
    pub id: String,
    pub name: String,
    /// Directory the release was declared in
    pub dir: PathBuf,
    pub chart: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub chart_version: String,
    pub cluster: ClusterTarget,
    pub namespace: String,
    pub values: Vec<String>,
    pub set: BTreeMap<String, String>,
    pub tags: Vec<String>,
    /// Node IDs this release depends on
    pub needs: Vec<String>,
    pub apply: ApplyOptions,
    pub delete: DeleteOptions,
    #[serde(skip_serializing_if = "HooksConfig::is_empty")]
    pub hooks: HooksConfig,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parallelism_group: String,
    pub critical: bool,
    pub execution_group: usize,
    /// Digest of everything that feeds an apply; also the apply cache key
    #[serde(skip_serializing_if = "String::is_empty")]
    pub effective_input_hash: String,
    /// Why the selector picked this node
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub selected_by: Vec<String>,
}

impl ResolvedRelease {
    pub fn node_id(cluster: &str, namespace: &str, name: &str) -> String {
        format!("{}/{}/{}", cluster, namespace, name)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether hooks wrap `command` for this node
    pub fn has_hooks_for(&self, command: StackCommand) -> bool {
        self.hooks.has_hooks_for(command)
    }
}

/// Immutable, ordered set of nodes for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Plan {
    pub stack_root: PathBuf,
    pub stack_name: String,
    pub profile: String,
    pub nodes: Vec<ResolvedRelease>,
    /// runOnce hooks from the root stack.yaml and its profile
    #[serde(skip_serializing_if = "HooksConfig::is_empty")]
    pub stack_hooks: HooksConfig,
    #[serde(skip)]
    index: BTreeMap<String, usize>,
}

impl Plan {
    pub fn new(
        stack_root: PathBuf,
        stack_name: String,
        profile: String,
        nodes: Vec<ResolvedRelease>,
        stack_hooks: HooksConfig,
    ) -> Self {
        let mut plan = Self {
            stack_root,
            stack_name,
            profile,
            nodes,
            stack_hooks,
            index: BTreeMap::new(),
        };
        plan.reindex();
        plan
    }

    /// Rebuild the id lookup after `nodes` changed
    pub fn reindex(&mut self) {
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
    }

    pub fn node(&self, id: &str) -> Option<&ResolvedRelease> {
        match self.index.get(id) {
            Some(&i) => self.nodes.get(i),
            None => self.nodes.iter().find(|n| n.id == id),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Nodes grouped by cluster name
    pub fn by_cluster(&self) -> BTreeMap<&str, Vec<&ResolvedRelease>> {
        let mut out: BTreeMap<&str, Vec<&ResolvedRelease>> = BTreeMap::new();
        for n in &self.nodes {
            out.entry(n.cluster.name.as_str()).or_default().push(n);
        }
        out
    }

    /// Copy of this plan restricted to `ids`, keeping the original order
    pub fn retain_ids(&self, keep: &std::collections::BTreeSet<String>) -> Plan {
        let nodes = self
            .nodes
            .iter()
            .filter(|n| keep.contains(&n.id))
            .cloned()
            .collect();
        Plan::new(
            self.stack_root.clone(),
            self.stack_name.clone(),
            self.profile.clone(),
            nodes,
            self.stack_hooks.clone(),
        )
    }
}
