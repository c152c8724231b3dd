// Dependency graph
// Resolves `needs` into node IDs, detects cycles and computes execution groups

use super::models::{Plan, ResolvedRelease};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to an unknown release
    UnknownDependency,
    /// needs across clusters, or otherwise malformed edges
    InvalidStructure,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidStructure,
        }
    }
}

/// Rewrite every `needs` entry into a node ID.
/// An entry is either a full `cluster/namespace/name` ID or a release name in the same cluster.
pub fn resolve_needs(nodes: &mut [ResolvedRelease]) -> Result<(), GraphError> {
    let ids: HashSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let mut by_cluster_name: HashMap<(String, String), String> = HashMap::new();
    let mut clusters_by_name: HashMap<String, Vec<String>> = HashMap::new();
    for n in nodes.iter() {
        by_cluster_name.insert((n.cluster.name.clone(), n.name.clone()), n.id.clone());
        clusters_by_name
            .entry(n.name.clone())
            .or_default()
            .push(n.cluster.name.clone());
    }

    for node in nodes.iter_mut() {
        let mut resolved = Vec::with_capacity(node.needs.len());
        for raw in &node.needs {
            let need = raw.trim();
            if need.is_empty() {
                continue;
            }
            let target = if need.split('/').count() == 3 {
                if !ids.contains(need) {
                    return Err(GraphError::unknown_dependency(format!(
                        "release {} needs missing dependency {:?}",
                        node.id, need
                    )));
                }
                let target_cluster = need.split('/').next().unwrap_or_default();
                if target_cluster != node.cluster.name {
                    return Err(cross_cluster(&node.id, need, target_cluster));
                }
                need.to_string()
            } else if let Some(id) =
                by_cluster_name.get(&(node.cluster.name.clone(), need.to_string()))
            {
                id.clone()
            } else if let Some(other) = clusters_by_name.get(need).and_then(|c| c.first()) {
                return Err(cross_cluster(&node.id, need, other));
            } else {
                return Err(GraphError::unknown_dependency(format!(
                    "release {} needs missing dependency {:?}",
                    node.id, need
                )));
            };
            if target == node.id {
                return Err(GraphError::cyclic(format!(
                    "dependency cycle detected: {} -> {}",
                    node.id, node.id
                )));
            }
            if !resolved.contains(&target) {
                resolved.push(target);
            }
        }
        resolved.sort();
        node.needs = resolved;
    }
    Ok(())
}

fn cross_cluster(id: &str, need: &str, other_cluster: &str) -> GraphError {
    GraphError::invalid_structure(format!(
        "release {} needs {:?} in cluster {:?}; needs across clusters are not supported",
        id, need, other_cluster
    ))
}

/// Edges between the nodes of one plan
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    deps: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build from node `needs`; edges to nodes outside the plan are ignored
    pub fn from_plan(plan: &Plan) -> Self {
        Self::from_nodes(&plan.nodes)
    }

    pub fn from_nodes(nodes: &[ResolvedRelease]) -> Self {
        let ids: BTreeSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let mut g = Self {
            nodes: ids.clone(),
            ..Default::default()
        };
        for n in nodes {
            for dep in &n.needs {
                if !ids.contains(dep) {
                    continue;
                }
                g.deps.entry(n.id.clone()).or_default().push(dep.clone());
                g.dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(n.id.clone());
            }
        }
        for list in g.deps.values_mut().chain(g.dependents.values_mut()) {
            list.sort();
            list.dedup();
        }
        g
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.iter()
    }

    /// Direct dependencies
    pub fn deps(&self, id: &str) -> &[String] {
        self.deps.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct dependents
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Transitive dependencies, sorted
    pub fn deps_of(&self, id: &str) -> Vec<String> {
        walk(id, &self.deps)
    }

    /// Transitive dependents, sorted
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        walk(id, &self.dependents)
    }

    /// Every (from, to) edge where `from` needs `to`
    pub fn edges(&self) -> Vec<(String, String)> {
        self.deps
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (from.clone(), to.clone())))
            .collect()
    }

    /// Kahn levels; group 0 has no dependencies. Ties are ordered by ID.
    pub fn execution_groups(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|id| (id.as_str(), self.deps(id).len()))
            .collect();

        let mut levels = Vec::new();
        let mut current: Vec<String> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id.to_string())
            .collect();
        let mut placed = 0usize;

        while !current.is_empty() {
            placed += current.len();
            let mut next = BTreeSet::new();
            for id in &current {
                for dependent in self.dependents(id) {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.insert(dependent.clone());
                        }
                    }
                }
            }
            levels.push(std::mem::take(&mut current));
            current = next.into_iter().collect();
        }

        if placed != self.nodes.len() {
            let cycle = self.find_cycle().unwrap_or_default();
            return Err(GraphError::cyclic(format!(
                "dependency cycle detected: {}",
                cycle.join(" -> ")
            )));
        }
        Ok(levels)
    }

    /// Topological order (level by level, IDs sorted inside a level)
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        Ok(self.execution_groups()?.into_iter().flatten().collect())
    }

    /// A cycle path such as `a -> b -> a`, if any
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack: Vec<String> = Vec::new();
        for id in &self.nodes {
            if visited.contains(id) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(id, &mut visited, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        id: &str,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(id.to_string());
        stack.push(id.to_string());
        for dep in self.deps(id) {
            if let Some(pos) = stack.iter().position(|s| s == dep) {
                let mut cycle = stack[pos..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
            if !visited.contains(dep) {
                if let Some(cycle) = self.dfs_cycle(dep, visited, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        None
    }
}

fn walk(id: &str, edges: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut queue = vec![id.to_string()];
    while let Some(cur) = queue.pop() {
        for next in edges.get(&cur).into_iter().flatten() {
            if seen.insert(next.clone()) {
                queue.push(next.clone());
            }
        }
    }
    seen.remove(id);
    seen.into_iter().collect()
}

/// Set `execution_group` on every node and order nodes topologically
pub fn order_plan(plan: &mut Plan) -> Result<(), GraphError> {
    let graph = DependencyGraph::from_plan(plan);
    let groups = graph.execution_groups()?;
    let mut position: HashMap<String, (usize, usize)> = HashMap::new();
    let mut pos = 0;
    for (level, ids) in groups.iter().enumerate() {
        for id in ids {
            position.insert(id.clone(), (level, pos));
            pos += 1;
        }
    }
    for node in &mut plan.nodes {
        if let Some(&(level, _)) = position.get(&node.id) {
            node.execution_group = level;
        }
    }
    plan.nodes
        .sort_by_key(|n| position.get(&n.id).map(|p| p.1).unwrap_or(usize::MAX));
    plan.reindex();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterTarget;
    use pretty_assertions::assert_eq;

    fn node(cluster: &str, name: &str, needs: &[&str]) -> ResolvedRelease {
        ResolvedRelease {
            id: ResolvedRelease::node_id(cluster, "default", name),
            name: name.to_string(),
            namespace: "default".into(),
            cluster: ClusterTarget {
                name: cluster.to_string(),
                ..Default::default()
            },
            needs: needs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_needs_by_name_and_id() {
        let mut nodes = vec![
            node("c1", "db", &[]),
            node("c1", "cache", &[]),
            node("c1", "api", &["db", "c1/default/cache"]),
        ];
        resolve_needs(&mut nodes).unwrap();
        assert_eq!(
            nodes[2].needs,
            vec!["c1/default/cache".to_string(), "c1/default/db".to_string()]
        );
    }

    #[test]
    fn test_resolve_needs_missing() {
        let mut nodes = vec![node("c1", "api", &["db"])];
        let err = resolve_needs(&mut nodes).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
        assert_eq!(
            err.message,
            "release c1/default/api needs missing dependency \"db\""
        );
    }

    #[test]
    fn test_resolve_needs_cross_cluster() {
        let mut nodes = vec![node("c2", "db", &[]), node("c1", "api", &["db"])];
        let err = resolve_needs(&mut nodes).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::InvalidStructure);
    }

    #[test]
    fn test_execution_groups() {
        let mut nodes = vec![
            node("c", "web", &["api"]),
            node("c", "api", &["db", "cache"]),
            node("c", "db", &[]),
            node("c", "cache", &[]),
            node("c", "docs", &[]),
        ];
        resolve_needs(&mut nodes).unwrap();
        let g = DependencyGraph::from_nodes(&nodes);
        let groups = g.execution_groups().unwrap();
        assert_eq!(
            groups,
            vec![
                vec!["c/default/cache", "c/default/db", "c/default/docs"],
                vec!["c/default/api"],
                vec!["c/default/web"],
            ]
        );
        assert_eq!(
            g.deps_of("c/default/web"),
            vec!["c/default/api", "c/default/cache", "c/default/db"]
        );
        assert_eq!(
            g.dependents_of("c/default/db"),
            vec!["c/default/api", "c/default/web"]
        );
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let mut nodes = vec![node("c", "a", &["b"]), node("c", "b", &["a"])];
        resolve_needs(&mut nodes).unwrap();
        let g = DependencyGraph::from_nodes(&nodes);
        let err = g.execution_groups().unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert_eq!(
            err.message,
            "dependency cycle detected: c/default/a -> c/default/b -> c/default/a"
        );
    }

    #[test]
    fn test_order_plan_sets_groups() {
        let mut nodes = vec![node("c", "b", &["a"]), node("c", "a", &[])];
        resolve_needs(&mut nodes).unwrap();
        let mut plan = Plan::new(
            "/s".into(),
            "s".into(),
            String::new(),
            nodes,
            Default::default(),
        );
        order_plan(&mut plan).unwrap();
        assert_eq!(plan.node_ids(), vec!["c/default/a", "c/default/b"]);
        assert_eq!(plan.node("c/default/b").unwrap().execution_group, 1);
    }
}
