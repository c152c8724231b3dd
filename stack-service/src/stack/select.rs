// Selector / planner
// Narrows a compiled plan by cluster, tag, path, release name or git range

use super::git;
use super::graph::{order_plan, DependencyGraph};
use super::merge::clean_path;
use super::models::Plan;
use crate::config::SelectorConfig;
use crate::error::{StackError, StackResult};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// What the operator asked to run; recorded verbatim in the run plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSelector {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub from_paths: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub git_range: String,
    pub include_deps: bool,
    pub include_dependents: bool,
    pub allow_missing_deps: bool,
}

impl RunSelector {
    pub fn from_config(cfg: &SelectorConfig) -> Self {
        Self {
            clusters: cfg.clusters.clone(),
            tags: cfg.tags.clone(),
            from_paths: cfg.from_paths.clone(),
            releases: cfg.releases.clone(),
            git_range: cfg.git_range.clone(),
            include_deps: cfg.include_deps.unwrap_or(false),
            include_dependents: cfg.include_dependents.unwrap_or(false),
            allow_missing_deps: cfg.allow_missing_deps.unwrap_or(false),
        }
    }

    fn has_explicit(&self) -> bool {
        !normalize(&self.tags).is_empty()
            || !normalize(&self.from_paths).is_empty()
            || !normalize(&self.releases).is_empty()
            || !self.git_range.trim().is_empty()
    }
}

/// Split comma lists and drop blanks
fn normalize(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_same_or_under(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Apply `sel` to a compiled plan and return the selected, re-ordered plan
pub fn select(plan: &Plan, sel: &RunSelector) -> StackResult<Plan> {
    let clusters: BTreeSet<String> = normalize(&sel.clusters).into_iter().collect();
    let scoped: Vec<_> = plan
        .nodes
        .iter()
        .filter(|n| clusters.is_empty() || clusters.contains(&n.cluster.name))
        .cloned()
        .collect();
    let scoped = Plan::new(
        plan.stack_root.clone(),
        plan.stack_name.clone(),
        plan.profile.clone(),
        scoped,
        plan.stack_hooks.clone(),
    );

    let mut reasons: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let add = |reasons: &mut BTreeMap<String, BTreeSet<String>>, id: &str, reason: String| {
        reasons.entry(id.to_string()).or_default().insert(reason);
    };

    if !sel.has_explicit() {
        for n in &scoped.nodes {
            add(&mut reasons, &n.id, "default:all".to_string());
        }
    } else {
        let tags: BTreeSet<String> = normalize(&sel.tags).into_iter().collect();
        if !tags.is_empty() {
            for n in &scoped.nodes {
                if let Some(t) = n.tags.iter().find(|t| tags.contains(*t)) {
                    add(&mut reasons, &n.id, format!("explicit:tag:{}", t));
                }
            }
        }

        let paths: Vec<PathBuf> = normalize(&sel.from_paths)
            .iter()
            .map(|p| {
                let p = Path::new(p);
                if p.is_absolute() {
                    clean_path(p)
                } else {
                    clean_path(&scoped.stack_root.join(p))
                }
            })
            .collect();
        for n in &scoped.nodes {
            if paths.iter().any(|want| is_same_or_under(&n.dir, want)) {
                let rel = n
                    .dir
                    .strip_prefix(&scoped.stack_root)
                    .map(|r| r.to_string_lossy().to_string())
                    .unwrap_or_else(|_| n.dir.to_string_lossy().to_string());
                let rel = if rel.is_empty() { ".".to_string() } else { rel };
                add(&mut reasons, &n.id, format!("explicit:path:{}", rel));
            }
        }

        for name in normalize(&sel.releases) {
            let matches: Vec<&str> = scoped
                .nodes
                .iter()
                .filter(|n| n.name == name || n.id == name)
                .map(|n| n.id.as_str())
                .collect();
            match matches.as_slice() {
                [] => {
                    return Err(StackError::Validation(format!(
                        "unknown release {:?}",
                        name
                    )))
                }
                [id] => add(&mut reasons, *id, format!("explicit:release:{}", name)),
                many => {
                    return Err(StackError::Validation(format!(
                        "ambiguous release name {:?} (matches {}); use --cluster to disambiguate",
                        name,
                        many.join(", ")
                    )))
                }
            }
        }

        if !sel.git_range.trim().is_empty() {
            let changed = git::changed_files(&scoped.stack_root, &sel.git_range)?;
            for (file, ids) in map_changed_files(&scoped, &changed) {
                for id in ids {
                    add(&mut reasons, &id, format!("explicit:git:{}", file));
                }
            }
        }
    }

    if sel.include_deps || sel.include_dependents {
        let graph = DependencyGraph::from_plan(&scoped);
        let explicit: Vec<String> = reasons.keys().cloned().collect();
        if sel.include_deps {
            for id in &explicit {
                for dep in graph.deps_of(id) {
                    if !reasons.contains_key(&dep) {
                        add(&mut reasons, &dep, format!("expand:dep-of:{}", id));
                    }
                }
            }
        }
        if sel.include_dependents {
            let current: Vec<String> = reasons.keys().cloned().collect();
            for id in &current {
                for dep in graph.dependents_of(id) {
                    if !reasons.contains_key(&dep) {
                        add(&mut reasons, &dep, format!("expand:dependent-of:{}", id));
                    }
                }
            }
        }
    }

    let keep: BTreeSet<String> = reasons.keys().cloned().collect();
    let mut out = scoped.retain_ids(&keep);
    for node in &mut out.nodes {
        node.selected_by = reasons
            .get(&node.id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default();
    }

    for node in &mut out.nodes {
        let missing: Vec<String> = node
            .needs
            .iter()
            .filter(|d| !keep.contains(*d))
            .cloned()
            .collect();
        if missing.is_empty() {
            continue;
        }
        if sel.allow_missing_deps {
            node.needs.retain(|d| keep.contains(d));
        } else {
            return Err(StackError::Dependency(format!(
                "selected release {} needs {:?} which is not selected (rerun with --include-deps)",
                node.id, missing[0]
            )));
        }
    }

    order_plan(&mut out)?;
    tracing::debug!(selected = out.nodes.len(), total = plan.nodes.len(), "selected nodes");
    Ok(out)
}

/// Map repo-relative changed files to the node IDs that own them
pub fn map_changed_files(plan: &Plan, changed: &[String]) -> BTreeMap<String, Vec<String>> {
    let root = &plan.stack_root;
    let mut mapped: BTreeMap<String, Vec<String>> = BTreeMap::new();

    // a changed stack.yaml affects every release under it
    for rel in changed {
        let abs = clean_path(&root.join(rel));
        if abs.file_name().and_then(|n| n.to_str()) != Some("stack.yaml") {
            continue;
        }
        let Some(stack_dir) = abs.parent() else {
            continue;
        };
        let ids: Vec<String> = plan
            .nodes
            .iter()
            .filter(|n| is_same_or_under(&n.dir, stack_dir))
            .map(|n| n.id.clone())
            .collect();
        if !ids.is_empty() {
            mapped.insert(rel.clone(), ids);
        }
    }

    let mut owners: BTreeMap<PathBuf, BTreeSet<String>> = BTreeMap::new();
    let mut add_owner = |dir: PathBuf, id: &str| {
        if is_same_or_under(&dir, root) {
            owners.entry(dir).or_default().insert(id.to_string());
        }
    };
    for n in &plan.nodes {
        add_owner(n.dir.clone(), &n.id);
        for v in &n.values {
            if v.contains("://") {
                continue;
            }
            if let Some(parent) = Path::new(v).parent() {
                add_owner(parent.to_path_buf(), &n.id);
            }
        }
        let chart = Path::new(&n.chart);
        if !n.chart.contains("://") && chart.exists() {
            let dir = if chart.is_file() {
                chart.parent().map(Path::to_path_buf).unwrap_or_default()
            } else {
                chart.to_path_buf()
            };
            add_owner(dir, &n.id);
        }
    }

    for rel in changed {
        if mapped.contains_key(rel) {
            continue;
        }
        let abs = clean_path(&root.join(rel));
        let mut dir = abs.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if let Some(ids) = owners.get(&d) {
                mapped.insert(rel.clone(), ids.iter().cloned().collect());
                break;
            }
            if d == *root {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
    }
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterTarget;
    use crate::stack::models::ResolvedRelease;
    use crate::stack::graph::resolve_needs;
    use pretty_assertions::assert_eq;

    fn node(cluster: &str, name: &str, dir: &str, tags: &[&str], needs: &[&str]) -> ResolvedRelease {
        ResolvedRelease {
            id: ResolvedRelease::node_id(cluster, "default", name),
            name: name.into(),
            dir: PathBuf::from(dir),
            namespace: "default".into(),
            chart: format!("{}/chart", dir),
            cluster: ClusterTarget {
                name: cluster.into(),
                ..Default::default()
            },
            tags: tags.iter().map(|s| s.to_string()).collect(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn sample_plan() -> Plan {
        let mut nodes = vec![
            node("prod", "db", "/s/data/db", &["data"], &[]),
            node("prod", "api", "/s/apps/api", &["web"], &["db"]),
            node("prod", "web", "/s/apps/web", &["web"], &["api"]),
            node("stage", "api", "/s/stage/api", &[], &[]),
        ];
        resolve_needs(&mut nodes).unwrap();
        let mut plan = Plan::new("/s".into(), "s".into(), String::new(), nodes, Default::default());
        order_plan(&mut plan).unwrap();
        plan
    }

    #[test]
    fn test_default_selects_everything() {
        let plan = select(&sample_plan(), &RunSelector::default()).unwrap();
        assert_eq!(plan.nodes.len(), 4);
        assert!(plan.nodes.iter().all(|n| n.selected_by == vec!["default:all"]));
    }

    #[test]
    fn test_tag_with_include_deps() {
        let sel = RunSelector {
            tags: vec!["web".into()],
            include_deps: true,
            ..Default::default()
        };
        let plan = select(&sample_plan(), &sel).unwrap();
        assert_eq!(
            plan.node_ids(),
            vec!["prod/default/db", "prod/default/api", "prod/default/web"]
        );
        assert_eq!(
            plan.node("prod/default/db").unwrap().selected_by,
            vec!["expand:dep-of:prod/default/api"]
        );
        assert_eq!(
            plan.node("prod/default/api").unwrap().selected_by,
            vec!["explicit:tag:web"]
        );
    }

    #[test]
    fn test_missing_dep_is_error_unless_allowed() {
        let sel = RunSelector {
            clusters: vec!["prod".into()],
            releases: vec!["api".into()],
            ..Default::default()
        };
        let err = select(&sample_plan(), &sel).unwrap_err();
        assert_eq!(
            err.to_string(),
            "selected release prod/default/api needs \"prod/default/db\" which is not selected (rerun with --include-deps)"
        );

        let sel = RunSelector {
            allow_missing_deps: true,
            ..sel
        };
        let plan = select(&sample_plan(), &sel).unwrap();
        assert_eq!(plan.node_ids(), vec!["prod/default/api"]);
        assert!(plan.nodes[0].needs.is_empty());
    }

    #[test]
    fn test_ambiguous_release_name() {
        let sel = RunSelector {
            releases: vec!["api".into()],
            ..Default::default()
        };
        let err = select(&sample_plan(), &sel).unwrap_err();
        assert!(err.to_string().contains("ambiguous release name"));

        let sel = RunSelector {
            releases: vec!["nope".into()],
            ..Default::default()
        };
        assert!(select(&sample_plan(), &sel)
            .unwrap_err()
            .to_string()
            .contains("unknown release"));
    }

    #[test]
    fn test_from_path_and_dependents() {
        let sel = RunSelector {
            from_paths: vec!["data".into()],
            include_dependents: true,
            ..Default::default()
        };
        let plan = select(&sample_plan(), &sel).unwrap();
        assert_eq!(
            plan.node("prod/default/db").unwrap().selected_by,
            vec!["explicit:path:data/db"]
        );
        assert_eq!(
            plan.node("prod/default/web").unwrap().selected_by,
            vec!["expand:dependent-of:prod/default/db"]
        );
    }

    #[test]
    fn test_map_changed_files() {
        let plan = sample_plan();
        let mapped = map_changed_files(
            &plan,
            &[
                "apps/api/values.yaml".to_string(),
                "data/stack.yaml".to_string(),
                "README.md".to_string(),
            ],
        );
        assert_eq!(mapped["apps/api/values.yaml"], vec!["prod/default/api"]);
        assert_eq!(mapped["data/stack.yaml"], vec!["prod/default/db"]);
        assert!(!mapped.contains_key("README.md"));
    }
}
