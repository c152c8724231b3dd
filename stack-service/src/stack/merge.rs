// Merge rules
// Layering of stack defaults, profile defaults and release overrides

use super::models::ResolvedRelease;
use crate::config::{
    ApplyOptions, DeleteOptions, HookPhase, HookSpec, HooksConfig, KubectlHookConfig,
    ReleaseDefaults, ReleaseSpec,
};

use std::path::{Component, Path, PathBuf};

/// Overlay one `defaults:` block onto a release
pub fn merge_defaults(dst: &mut ResolvedRelease, base_dir: &Path, d: &ReleaseDefaults) {
    if !d.cluster.name.is_empty() {
        dst.cluster.name = d.cluster.name.clone();
    }
    if !d.cluster.kubeconfig.is_empty() {
        dst.cluster.kubeconfig = d.cluster.kubeconfig.clone();
    }
    if !d.cluster.context.is_empty() {
        dst.cluster.context = d.cluster.context.clone();
    }
    if !d.namespace.is_empty() {
        dst.namespace = d.namespace.clone();
    }
    dst.values.extend(resolve_paths(base_dir, &d.values));
    dst.tags.extend(d.tags.iter().cloned());
    for (k, v) in &d.set {
        dst.set.insert(k.clone(), v.clone());
    }
    merge_apply(&mut dst.apply, &d.apply);
    merge_delete(&mut dst.delete, &d.delete);
}

/// Overlay the release's own fields; `needs` replaces rather than appends
pub fn merge_release_override(dst: &mut ResolvedRelease, base_dir: &Path, r: &ReleaseSpec) {
    if !r.name.is_empty() {
        dst.name = r.name.clone();
    }
    if !r.chart.is_empty() {
        dst.chart = resolve_path(base_dir, &r.chart);
    }
    if !r.chart_version.is_empty() {
        dst.chart_version = r.chart_version.clone();
    }
    if r.critical {
        dst.critical = true;
    }
    if !r.parallelism_group.is_empty() {
        dst.parallelism_group = r.parallelism_group.clone();
    }
    if !r.cluster.name.is_empty() {
        dst.cluster.name = r.cluster.name.clone();
    }
    if !r.cluster.kubeconfig.is_empty() {
        dst.cluster.kubeconfig = r.cluster.kubeconfig.clone();
    }
    if !r.cluster.context.is_empty() {
        dst.cluster.context = r.cluster.context.clone();
    }
    if !r.namespace.is_empty() {
        dst.namespace = r.namespace.clone();
    }
    dst.values.extend(resolve_paths(base_dir, &r.values));
    for (k, v) in &r.set {
        dst.set.insert(k.clone(), v.clone());
    }
    dst.tags.extend(r.tags.iter().cloned());
    if !r.needs.is_empty() {
        dst.needs = r.needs.clone();
    }
    merge_hooks(&mut dst.hooks, base_dir, &r.hooks, false);
    merge_apply(&mut dst.apply, &r.apply);
    merge_delete(&mut dst.delete, &r.delete);
}

fn merge_apply(dst: &mut ApplyOptions, src: &ApplyOptions) {
    if src.atomic.is_some() {
        dst.atomic = src.atomic;
    }
    if src.timeout.is_some() {
        dst.timeout = src.timeout;
    }
    if src.wait.is_some() {
        dst.wait = src.wait;
    }
    if src.create_namespace.is_some() {
        dst.create_namespace = src.create_namespace;
    }
}

fn merge_delete(dst: &mut DeleteOptions, src: &DeleteOptions) {
    if src.timeout.is_some() {
        dst.timeout = src.timeout;
    }
}

/// Append hooks from `src`, resolving their paths against `base_dir`.
/// runOnce hooks are dropped unless `keep_run_once` is set.
pub fn merge_hooks(dst: &mut HooksConfig, base_dir: &Path, src: &HooksConfig, keep_run_once: bool) {
    for phase in HookPhase::ALL {
        let resolved = src
            .for_phase(phase)
            .iter()
            .filter(|h| keep_run_once || !h.run_once)
            .map(|h| resolve_hook_paths(base_dir, h));
        dst.for_phase_mut(phase).extend(resolved);
    }
}

fn resolve_hook_paths(base_dir: &Path, hook: &HookSpec) -> HookSpec {
    let mut out = hook.clone();
    if let Some(kubectl) = &hook.kubectl {
        out.kubectl = Some(KubectlHookConfig {
            args: resolve_kubectl_args(base_dir, &kubectl.args),
        });
    }
    if let Some(script) = &mut out.script {
        if !script.work_dir.trim().is_empty() {
            script.work_dir = resolve_path(base_dir, &script.work_dir);
        }
        if let Some(first) = script.command.first_mut() {
            let trimmed = first.trim();
            if trimmed.contains('/') || trimmed.starts_with('.') {
                *first = resolve_path(base_dir, trimmed);
            }
        }
    }
    out
}

fn resolve_kubectl_args(base_dir: &Path, args: &[String]) -> Vec<String> {
    let mut out = args.to_vec();
    for i in 0..out.len().saturating_sub(1) {
        if out[i] == "-f" || out[i] == "--filename" {
            out[i + 1] = resolve_path(base_dir, &out[i + 1]);
        }
    }
    out
}

pub fn resolve_paths(base_dir: &Path, values: &[String]) -> Vec<String> {
    values.iter().map(|v| resolve_path(base_dir, v)).collect()
}

/// Resolve `p` against `base_dir`; URLs (`oci://...`) are returned untouched
pub fn resolve_path(base_dir: &Path, p: &str) -> String {
    let p = p.trim();
    if p.is_empty() || p.contains("://") {
        return p.to_string();
    }
    let path = Path::new(p);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    };
    clean_path(&joined).to_string_lossy().to_string()
}

/// Lexically normalize `.` and `..` components
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HookType, ScriptHookConfig};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/stack/apps");
        assert_eq!(resolve_path(base, "./chart"), "/stack/apps/chart");
        assert_eq!(resolve_path(base, "../shared/values.yaml"), "/stack/shared/values.yaml");
        assert_eq!(resolve_path(base, "/abs/values.yaml"), "/abs/values.yaml");
        assert_eq!(
            resolve_path(base, "oci://registry/charts/api"),
            "oci://registry/charts/api"
        );
        assert_eq!(resolve_path(base, ""), "");
    }

    #[test]
    fn test_defaults_then_override() {
        let mut node = ResolvedRelease::default();
        let defaults = ReleaseDefaults {
            namespace: "apps".into(),
            values: vec!["common.yaml".into()],
            tags: vec!["team-a".into()],
            set: BTreeMap::from([
                ("image.tag".to_string(), "1".to_string()),
                ("replicas".to_string(), "1".to_string()),
            ]),
            apply: ApplyOptions {
                timeout: Some(Duration::from_secs(300)),
                atomic: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        merge_defaults(&mut node, Path::new("/s"), &defaults);

        let spec = ReleaseSpec {
            name: "api".into(),
            chart: "./chart".into(),
            namespace: "api".into(),
            values: vec!["values.yaml".into()],
            tags: vec!["web".into()],
            set: BTreeMap::from([("replicas".to_string(), "3".to_string())]),
            needs: vec!["db".into()],
            apply: ApplyOptions {
                atomic: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        merge_release_override(&mut node, Path::new("/s/api"), &spec);

        assert_eq!(node.name, "api");
        assert_eq!(node.chart, "/s/api/chart");
        assert_eq!(node.namespace, "api");
        assert_eq!(node.values, vec!["/s/common.yaml", "/s/api/values.yaml"]);
        assert_eq!(node.tags, vec!["team-a", "web"]);
        assert_eq!(node.set["replicas"], "3");
        assert_eq!(node.set["image.tag"], "1");
        assert_eq!(node.needs, vec!["db"]);
        assert_eq!(node.apply.timeout, Some(Duration::from_secs(300)));
        assert_eq!(node.apply.atomic, Some(false));
    }

    #[test]
    fn test_merge_hooks_resolves_paths_and_drops_run_once() {
        let src = HooksConfig {
            pre_apply: vec![
                HookSpec {
                    name: "migrate".into(),
                    hook_type: Some(HookType::Script),
                    script: Some(ScriptHookConfig {
                        command: vec!["./migrate.sh".into(), "up".into()],
                        work_dir: "scripts".into(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                HookSpec {
                    name: "once".into(),
                    run_once: true,
                    ..Default::default()
                },
            ],
            post_apply: vec![HookSpec {
                hook_type: Some(HookType::Kubectl),
                kubectl: Some(KubectlHookConfig {
                    args: vec!["apply".into(), "-f".into(), "job.yaml".into()],
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut dst = HooksConfig::default();
        merge_hooks(&mut dst, Path::new("/s/db"), &src, false);

        assert_eq!(dst.pre_apply.len(), 1);
        let script = dst.pre_apply[0].script.as_ref().unwrap();
        assert_eq!(script.command, vec!["/s/db/migrate.sh", "up"]);
        assert_eq!(script.work_dir, "/s/db/scripts");
        assert_eq!(
            dst.post_apply[0].kubectl.as_ref().unwrap().args,
            vec!["apply", "-f", "/s/db/job.yaml"]
        );
    }
}
