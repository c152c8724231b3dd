// Graph resolver
// Compiles a discovered stack into validated, dependency-ordered release nodes

use super::graph::{order_plan, resolve_needs};
use super::inputs::annotate_input_hashes;
use super::merge::{merge_defaults, merge_hooks, merge_release_override};
use super::models::{Plan, ResolvedRelease};
use crate::config::{discover, DiscoveredRelease, HooksConfig, Universe};
use crate::error::{StackError, StackResult};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Empty = the root stack.yaml defaultProfile
    pub profile: String,
}

/// Discover, compile and fingerprint the stack at `root`
pub fn load_stack(root: &Path, profile: &str) -> StackResult<(Universe, Plan)> {
    let universe = discover(root)?;
    let mut plan = compile(
        &universe,
        &CompileOptions {
            profile: profile.to_string(),
        },
    )?;
    annotate_input_hashes(&mut plan)?;
    Ok((universe, plan))
}

/// Merge every discovered release and validate the resulting graph
pub fn compile(u: &Universe, opts: &CompileOptions) -> StackResult<Plan> {
    let profile = u.effective_profile(&opts.profile);
    if !profile.is_empty() && u.root_profile(&profile).is_none() {
        return Err(StackError::Validation(format!(
            "unknown profile {:?} (not declared in {}/stack.yaml)",
            profile,
            u.root_dir.display()
        )));
    }

    let mut nodes = u
        .releases
        .iter()
        .map(|dr| resolve_release(u, dr, &profile))
        .collect::<StackResult<Vec<_>>>()?;
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let mut seen_ids: HashMap<&str, &Path> = HashMap::new();
    let mut seen_names: HashMap<(&str, &str), &str> = HashMap::new();
    for n in &nodes {
        if n.cluster.name.trim().is_empty() {
            return Err(StackError::Validation(format!(
                "cluster.name is required for every release (missing on {} in {})",
                n.name,
                n.dir.display()
            )));
        }
        if let Some(prev_dir) = seen_ids.insert(n.id.as_str(), n.dir.as_path()) {
            return Err(StackError::Validation(format!(
                "duplicate release id {} ({} vs {})",
                n.id,
                prev_dir.display(),
                n.dir.display()
            )));
        }
        if let Some(prev) = seen_names.insert((n.cluster.name.as_str(), n.name.as_str()), n.id.as_str()) {
            return Err(StackError::Validation(format!(
                "duplicate release name {:?} in cluster {:?} ({} vs {})",
                n.name, n.cluster.name, prev, n.id
            )));
        }
    }

    resolve_needs(&mut nodes)?;

    let mut plan = Plan::new(
        u.root_dir.clone(),
        u.stack_name.clone(),
        profile.clone(),
        nodes,
        stack_hooks(u, &profile),
    );
    order_plan(&mut plan)?;

    tracing::debug!(
        stack = %plan.stack_name,
        profile = %plan.profile,
        nodes = plan.nodes.len(),
        "compiled stack"
    );
    Ok(plan)
}

/// runOnce hooks of the root stack.yaml followed by its profile's
fn stack_hooks(u: &Universe, profile: &str) -> HooksConfig {
    let mut out = HooksConfig::default();
    if let Some(root) = u.root_stack() {
        merge_hooks(&mut out, &u.root_dir, &root.hooks.filter_run_once(true), true);
    }
    if let Some(p) = u.root_profile(profile) {
        merge_hooks(&mut out, &u.root_dir, &p.hooks.filter_run_once(true), true);
    }
    out
}

fn resolve_release(
    u: &Universe,
    dr: &DiscoveredRelease,
    profile: &str,
) -> StackResult<ResolvedRelease> {
    let mut node = ResolvedRelease {
        name: dr.spec.name.clone(),
        dir: dr.dir.clone(),
        set: BTreeMap::new(),
        ..Default::default()
    };

    for dir in stack_chain(&u.root_dir, &dr.dir)? {
        let Some(sf) = u.stacks.get(&dir) else {
            continue;
        };
        merge_defaults(&mut node, &dir, &sf.defaults);
        merge_hooks(&mut node.hooks, &dir, &sf.hooks, false);
        if !profile.is_empty() {
            if let Some(sp) = sf.profiles.get(profile) {
                merge_defaults(&mut node, &dir, &sp.defaults);
                merge_hooks(&mut node.hooks, &dir, &sp.hooks, false);
            }
        }
    }
    merge_release_override(&mut node, &dr.dir, &dr.spec);

    if node.namespace.is_empty() {
        node.namespace = "default".to_string();
    }
    node.id = ResolvedRelease::node_id(&node.cluster.name, &node.namespace, &node.name);
    Ok(node)
}

/// Directories from the stack root down to `dir`, root first
fn stack_chain(root: &Path, dir: &Path) -> StackResult<Vec<PathBuf>> {
    let rel = dir.strip_prefix(root).map_err(|_| {
        StackError::Validation(format!(
            "release {} is outside stack root {}",
            dir.display(),
            root.display()
        ))
    })?;
    let mut chain = vec![root.to_path_buf()];
    let mut cur = root.to_path_buf();
    for component in rel.components() {
        cur.push(component);
        chain.push(cur.clone());
    }
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HookPhase;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn sample_stack() -> TempDir {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "stack.yaml",
            r#"
apiVersion: ktl.dev/v1
kind: Stack
name: platform
defaultProfile: dev
defaults:
  cluster:
    name: prod
  values: [common.yaml]
  tags: [platform]
profiles:
  dev:
    defaults:
      namespace: dev
  ci:
    hooks:
      postApply:
        - name: report
          type: http
          runOnce: true
          http:
            url: https://ci.example/report
hooks:
  preApply:
    - name: announce
      type: script
      runOnce: true
      script:
        command: ["./announce.sh"]
"#,
        );
        write(
            tmp.path(),
            "apps/stack.yaml",
            r#"
defaults:
  namespace: apps
  tags: [apps]
hooks:
  postApply:
    - name: smoke
      type: script
      script:
        command: ["./smoke.sh"]
"#,
        );
        write(
            tmp.path(),
            "apps/api/release.yaml",
            "name: api\nchart: ./chart\nneeds: [db]\nvalues: [values.yaml]\n",
        );
        write(
            tmp.path(),
            "data/release.yaml",
            "name: db\nchart: oci://registry/charts/postgres\nnamespace: data\n",
        );
        tmp
    }

    #[test]
    fn test_compile_merges_chain_and_profile() {
        let tmp = sample_stack();
        let u = discover(tmp.path()).unwrap();
        let plan = compile(&u, &CompileOptions::default()).unwrap();
        let root = &u.root_dir;

        assert_eq!(plan.profile, "dev");
        assert_eq!(plan.node_ids(), vec!["prod/data/db", "prod/apps/api"]);

        let api = plan.node("prod/apps/api").unwrap();
        // apps/stack.yaml namespace overrides the profile's dev namespace
        assert_eq!(api.namespace, "apps");
        assert_eq!(api.tags, vec!["platform", "apps"]);
        assert_eq!(
            api.values,
            vec![
                root.join("common.yaml").to_string_lossy().to_string(),
                root.join("apps/api/values.yaml").to_string_lossy().to_string(),
            ]
        );
        assert_eq!(api.chart, root.join("apps/api/chart").to_string_lossy());
        assert_eq!(api.needs, vec!["prod/data/db"]);
        assert_eq!(api.execution_group, 1);
        assert_eq!(api.hooks.post_apply.len(), 1);
        assert_eq!(
            api.hooks.post_apply[0].script.as_ref().unwrap().command[0],
            root.join("apps/smoke.sh").to_string_lossy()
        );

        let db = plan.node("prod/data/db").unwrap();
        assert_eq!(db.chart, "oci://registry/charts/postgres");
        assert!(db.hooks.is_empty());

        assert_eq!(plan.stack_hooks.for_phase(HookPhase::PreApply).len(), 1);
        assert!(plan.stack_hooks.post_apply.is_empty());
    }

    #[test]
    fn test_profile_adds_stack_hooks() {
        let tmp = sample_stack();
        let u = discover(tmp.path()).unwrap();
        let plan = compile(
            &u,
            &CompileOptions {
                profile: "ci".into(),
            },
        )
        .unwrap();
        assert_eq!(plan.stack_hooks.post_apply.len(), 1);
        assert_eq!(plan.node("prod/data/db").unwrap().namespace, "data");
    }

    #[test]
    fn test_unknown_profile() {
        let tmp = sample_stack();
        let u = discover(tmp.path()).unwrap();
        let err = compile(
            &u,
            &CompileOptions {
                profile: "nope".into(),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown profile"));
    }

    #[test]
    fn test_missing_cluster_name() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "stack.yaml", "name: s\n");
        write(tmp.path(), "a/release.yaml", "name: a\nchart: c\n");
        let u = discover(tmp.path()).unwrap();
        let err = compile(&u, &CompileOptions::default()).unwrap_err();
        assert_eq!(err.class(), "VALIDATION");
        assert!(err.to_string().contains("cluster.name is required"));
    }

    #[test]
    fn test_duplicate_release_name_in_cluster() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "stack.yaml",
            "defaults:\n  cluster:\n    name: c\n",
        );
        write(tmp.path(), "a/release.yaml", "name: web\nchart: x\nnamespace: a\n");
        write(tmp.path(), "b/release.yaml", "name: web\nchart: x\nnamespace: b\n");
        let u = discover(tmp.path()).unwrap();
        let err = compile(&u, &CompileOptions::default()).unwrap_err();
        assert!(err.to_string().contains("duplicate release name \"web\""));
    }

    #[test]
    fn test_cycle_is_dependency_error() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "stack.yaml",
            "defaults:\n  cluster:\n    name: c\nreleases:\n  - name: a\n    chart: x\n    needs: [b]\n  - name: b\n    chart: x\n    needs: [a]\n",
        );
        let u = discover(tmp.path()).unwrap();
        let err = compile(&u, &CompileOptions::default()).unwrap_err();
        assert_eq!(err.class(), "DEPENDENCY");
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: c/default/a -> c/default/b -> c/default/a"
        );
    }
}
