// Effective input hashing
// Content fingerprint of everything that feeds an apply, plus drift comparison

use super::models::{Plan, ResolvedRelease};
use crate::config::{ApplyOptions, DeleteOptions, HooksConfig};
use crate::error::{StackError, StackResult};

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// NUL-delimited sha256 writer used by every digest in this module
struct FieldHasher(Sha256);

impl FieldHasher {
    fn new(domain: &str) -> Self {
        let mut h = Self(Sha256::new());
        h.write(domain);
        h
    }

    fn write(&mut self, s: &str) {
        self.0.update(s.as_bytes());
        self.0.update([0u8]);
    }

    fn finish(self) -> String {
        format!("sha256:{}", hex::encode(self.0.finalize()))
    }
}

pub fn sha256_bytes(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct EffectiveInputV1<'a> {
    api_version: &'static str,
    ktl_version: &'static str,
    node_id: &'a str,
    chart_ref: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    chart_version: &'a str,
    #[serde(skip_serializing_if = "String::is_empty")]
    chart_digest: String,
    values_digests: Vec<String>,
    set_digest: String,
    cluster_digest: String,
    apply: &'a ApplyOptions,
    delete: &'a DeleteOptions,
    hooks_digest: String,
}

/// Hash of chart, values, overrides, cluster, options and hooks for one node
pub fn compute_effective_input_hash(node: &ResolvedRelease) -> StackResult<String> {
    let input = EffectiveInputV1 {
        api_version: "ktl.dev/stack-effective-input-hash/v1",
        ktl_version: TOOL_VERSION,
        node_id: &node.id,
        chart_ref: &node.chart,
        chart_version: &node.chart_version,
        chart_digest: digest_local_chart(&node.chart)?,
        values_digests: digest_values(&node.values)?,
        set_digest: digest_set(&node.set),
        cluster_digest: digest_cluster(node),
        apply: &node.apply,
        delete: &node.delete,
        hooks_digest: digest_hooks(&node.hooks)?,
    };
    let raw = serde_json::to_vec(&input)
        .map_err(|e| StackError::Validation(format!("encode effective input: {}", e)))?;
    Ok(sha256_bytes(&raw))
}

/// Fill `effective_input_hash` on every node of the plan
pub fn annotate_input_hashes(plan: &mut Plan) -> StackResult<()> {
    for node in &mut plan.nodes {
        node.effective_input_hash = compute_effective_input_hash(node)?;
    }
    Ok(())
}

fn is_local(path: &str) -> bool {
    !path.is_empty() && !path.contains("://")
}

fn digest_values(paths: &[String]) -> StackResult<Vec<String>> {
    paths
        .iter()
        .map(|p| {
            if !is_local(p) {
                return Ok(format!("ref:{}", p));
            }
            let data = fs::read(p).map_err(|e| {
                StackError::Validation(format!("read values file {}: {}", p, e))
            })?;
            Ok(sha256_bytes(&data))
        })
        .collect()
}

/// Digest of a local chart directory (or packaged chart); empty for remote refs
fn digest_local_chart(chart: &str) -> StackResult<String> {
    if !is_local(chart) {
        return Ok(String::new());
    }
    let path = Path::new(chart);
    if path.is_file() {
        let data = fs::read(path)
            .map_err(|e| StackError::Validation(format!("read chart {}: {}", chart, e)))?;
        return Ok(sha256_bytes(&data));
    }
    if !path.is_dir() {
        // repo/name style reference resolved by the backend
        return Ok(String::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry
            .map_err(|e| StackError::Validation(format!("walk chart {}: {}", chart, e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let data = fs::read(entry.path()).map_err(|e| {
            StackError::Validation(format!("read chart file {}: {}", entry.path().display(), e))
        })?;
        files.push((rel, hex::encode(Sha256::digest(&data))));
    }
    files.sort();

    let mut h = FieldHasher::new("ktl.stack-chart.v1");
    for (name, sum) in files {
        h.write(&name);
        h.write(&sum);
    }
    Ok(h.finish())
}

fn digest_set(set: &BTreeMap<String, String>) -> String {
    let mut h = FieldHasher::new("ktl.stack-set.v1");
    for (k, v) in set {
        h.write(k);
        h.write(v);
    }
    h.finish()
}

fn digest_cluster(node: &ResolvedRelease) -> String {
    let mut h = FieldHasher::new("ktl.stack-cluster.v1");
    h.write(&node.cluster.name);
    h.write(&node.cluster.context);
    h.write(&node.namespace);
    h.finish()
}

fn digest_hooks(hooks: &HooksConfig) -> StackResult<String> {
    if hooks.is_empty() {
        return Ok(String::new());
    }
    let raw = serde_json::to_vec(hooks)
        .map_err(|e| StackError::Validation(format!("encode hooks: {}", e)))?;
    Ok(sha256_bytes(&raw))
}

/// Nodes whose inputs changed since a stored plan was built
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    /// Present in both, hash differs
    pub changed: Vec<DriftEntry>,
    /// In the stored plan but gone from the stack
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftEntry {
    pub node_id: String,
    pub stored: String,
    pub current: String,
}

impl DriftReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for c in &self.changed {
            parts.push(format!("{} changed", c.node_id));
        }
        for r in &self.removed {
            parts.push(format!("{} removed", r));
        }
        parts.join(", ")
    }
}

/// Compare stored node hashes with a freshly compiled plan
pub fn drift_report<'a>(
    stored: impl IntoIterator<Item = &'a ResolvedRelease>,
    current: &Plan,
) -> DriftReport {
    let mut report = DriftReport::default();
    for node in stored {
        match current.node(&node.id) {
            None => report.removed.push(node.id.clone()),
            Some(cur) if cur.effective_input_hash != node.effective_input_hash => {
                report.changed.push(DriftEntry {
                    node_id: node.id.clone(),
                    stored: node.effective_input_hash.clone(),
                    current: cur.effective_input_hash.clone(),
                })
            }
            Some(_) => {}
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterTarget;
    use tempfile::TempDir;

    fn node_with_chart(dir: &Path) -> ResolvedRelease {
        ResolvedRelease {
            id: "c/ns/api".into(),
            name: "api".into(),
            namespace: "ns".into(),
            chart: dir.join("chart").to_string_lossy().to_string(),
            cluster: ClusterTarget {
                name: "c".into(),
                ..Default::default()
            },
            values: vec![dir.join("values.yaml").to_string_lossy().to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_tracks_chart_and_values_content() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("chart/templates")).unwrap();
        fs::write(tmp.path().join("chart/Chart.yaml"), "name: api\n").unwrap();
        fs::write(tmp.path().join("chart/templates/cm.yaml"), "kind: ConfigMap\n").unwrap();
        fs::write(tmp.path().join("values.yaml"), "replicas: 1\n").unwrap();

        let node = node_with_chart(tmp.path());
        let first = compute_effective_input_hash(&node).unwrap();
        assert_eq!(first, compute_effective_input_hash(&node).unwrap());

        fs::write(tmp.path().join("values.yaml"), "replicas: 2\n").unwrap();
        let second = compute_effective_input_hash(&node).unwrap();
        assert_ne!(first, second);

        fs::write(tmp.path().join("chart/templates/cm.yaml"), "kind: Secret\n").unwrap();
        assert_ne!(second, compute_effective_input_hash(&node).unwrap());
    }

    #[test]
    fn test_missing_values_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let node = node_with_chart(tmp.path());
        let err = compute_effective_input_hash(&node).unwrap_err();
        assert!(err.to_string().contains("read values file"));
    }

    #[test]
    fn test_drift_report() {
        let a = ResolvedRelease {
            id: "c/ns/a".into(),
            effective_input_hash: "sha256:1".into(),
            ..Default::default()
        };
        let b = ResolvedRelease {
            id: "c/ns/b".into(),
            effective_input_hash: "sha256:2".into(),
            ..Default::default()
        };
        let mut a2 = a.clone();
        a2.effective_input_hash = "sha256:9".into();
        let current = Plan::new("/s".into(), "s".into(), String::new(), vec![a2], Default::default());

        let report = drift_report([&a, &b], &current);
        assert_eq!(report.changed.len(), 1);
        assert_eq!(report.removed, vec!["c/ns/b".to_string()]);
        assert!(!report.is_empty());
        assert_eq!(report.summary(), "c/ns/a changed, c/ns/b removed");
    }
}
