// Helm backend
// Drives the helm and kubectl CLIs found on PATH

use super::{ApplyOutcome, BackendError, ClusterClient, DeployBackend, ReleaseRequest};
use crate::config::ClusterTarget;
use crate::runners::process::{run_process, ProcessOutput, ProcessSpec};
use crate::runners::expand_tilde;
use crate::stack::inputs::sha256_bytes;

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Extra wall time given to helm beyond its own --timeout
const PROCESS_GRACE: Duration = Duration::from_secs(60);

fn locate(name: &str) -> PathBuf {
    which::which(name).unwrap_or_else(|_| PathBuf::from(name))
}

fn helm_duration(d: Duration) -> String {
    format!("{}s", d.as_secs().max(1))
}

#[derive(Debug, Clone)]
pub struct HelmBackend {
    binary: PathBuf,
}

impl HelmBackend {
    pub fn new() -> Self {
        Self {
            binary: locate("helm"),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn connection_args(req: &ReleaseRequest<'_>) -> Vec<String> {
        let (kubeconfig, context) = req.kube_target();
        let mut args = Vec::new();
        if !kubeconfig.is_empty() {
            args.extend(["--kubeconfig".to_string(), kubeconfig]);
        }
        if !context.is_empty() {
            args.extend(["--kube-context".to_string(), context]);
        }
        args.extend(["--namespace".to_string(), req.node.namespace.clone()]);
        args
    }

    /// `helm upgrade --install` arguments for a node
    pub fn apply_args(req: &ReleaseRequest<'_>) -> Vec<String> {
        let node = req.node;
        let opts = &node.apply;
        let mut args = vec![
            "upgrade".to_string(),
            "--install".to_string(),
            node.name.clone(),
            node.chart.clone(),
        ];
        if !node.chart_version.trim().is_empty() {
            args.extend(["--version".to_string(), node.chart_version.clone()]);
        }
        for values in &node.values {
            args.extend(["--values".to_string(), values.clone()]);
        }
        for (k, v) in &node.set {
            args.extend(["--set".to_string(), format!("{}={}", k, v)]);
        }
        if opts.atomic.unwrap_or(true) {
            args.push("--atomic".to_string());
        }
        if opts.wait.unwrap_or(true) {
            args.push("--wait".to_string());
        }
        if opts.create_namespace.unwrap_or(false) {
            args.push("--create-namespace".to_string());
        }
        args.extend([
            "--timeout".to_string(),
            helm_duration(opts.timeout.unwrap_or(DEFAULT_APPLY_TIMEOUT)),
        ]);
        args.extend(Self::connection_args(req));
        args
    }

    pub fn delete_args(req: &ReleaseRequest<'_>) -> Vec<String> {
        let mut args = vec!["uninstall".to_string(), req.node.name.clone(), "--wait".to_string()];
        if let Some(timeout) = req.node.delete.timeout {
            args.extend(["--timeout".to_string(), helm_duration(timeout)]);
        }
        args.extend(Self::connection_args(req));
        args
    }

    async fn helm(
        &self,
        args: Vec<String>,
        timeout: Duration,
        req: &ReleaseRequest<'_>,
    ) -> Result<ProcessOutput, BackendError> {
        let spec = ProcessSpec {
            program: self.binary.to_string_lossy().to_string(),
            args,
            work_dir: Some(req.node.dir.clone()),
            env: Default::default(),
            timeout: Some(timeout + PROCESS_GRACE),
        };
        run_process(&spec, req.on_log.clone())
            .await
            .map_err(|e| BackendError::new(format!("helm: {}", e)))
    }

    async fn get_manifest(&self, req: &ReleaseRequest<'_>) -> Result<Option<String>, BackendError> {
        let mut args = vec!["get".to_string(), "manifest".to_string(), req.node.name.clone()];
        args.extend(Self::connection_args(req));
        let quiet = ReleaseRequest {
            on_log: None,
            ..req.clone()
        };
        let out = self.helm(args, Duration::from_secs(60), &quiet).await?;
        if out.success() {
            return Ok(Some(out.stdout));
        }
        if is_not_found(&out) {
            return Ok(None);
        }
        Err(BackendError::new(format!(
            "helm get manifest {}: {}",
            req.node.name,
            out.failure_detail()
        )))
    }
}

impl Default for HelmBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn is_not_found(out: &ProcessOutput) -> bool {
    let text = out.combined().to_ascii_lowercase();
    text.contains("release: not found") || text.contains("not found")
}

fn manifest_digest(manifest: &str) -> String {
    sha256_bytes(manifest.trim().as_bytes())
}

#[async_trait::async_trait]
impl DeployBackend for HelmBackend {
    async fn apply(&self, req: &ReleaseRequest<'_>) -> Result<ApplyOutcome, BackendError> {
        let timeout = req.node.apply.timeout.unwrap_or(DEFAULT_APPLY_TIMEOUT);
        let out = self.helm(Self::apply_args(req), timeout, req).await?;
        if !out.success() {
            return Err(BackendError::new(format!(
                "helm upgrade --install {}: {}",
                req.node.name,
                out.failure_detail()
            )));
        }
        let manifest = self.get_manifest(req).await?.unwrap_or_default();
        let observed_digest = (!manifest.trim().is_empty()).then(|| manifest_digest(&manifest));
        Ok(ApplyOutcome {
            manifest,
            observed_digest,
        })
    }

    async fn delete(&self, req: &ReleaseRequest<'_>) -> Result<(), BackendError> {
        let timeout = req.node.delete.timeout.unwrap_or(DEFAULT_APPLY_TIMEOUT);
        let out = self.helm(Self::delete_args(req), timeout, req).await?;
        if out.success() {
            return Ok(());
        }
        if is_not_found(&out) {
            tracing::info!(release = %req.node.id, "release already absent");
            return Ok(());
        }
        Err(BackendError::new(format!(
            "helm uninstall {}: {}",
            req.node.name,
            out.failure_detail()
        )))
    }

    async fn observed_digest(&self, req: &ReleaseRequest<'_>) -> Result<Option<String>, BackendError> {
        Ok(self
            .get_manifest(req)
            .await?
            .filter(|m| !m.trim().is_empty())
            .map(|m| manifest_digest(&m)))
    }
}

/// Probes clusters with `kubectl version`
#[derive(Debug, Clone)]
pub struct KubectlClusterClient {
    binary: PathBuf,
    /// Used when a cluster leaves kubeconfig/context empty
    pub kubeconfig: String,
    pub kube_context: String,
}

impl KubectlClusterClient {
    pub fn new(kubeconfig: impl Into<String>, kube_context: impl Into<String>) -> Self {
        Self {
            binary: locate("kubectl"),
            kubeconfig: kubeconfig.into(),
            kube_context: kube_context.into(),
        }
    }

    pub fn check_args(&self, cluster: &ClusterTarget) -> Vec<String> {
        let or = |a: &str, b: &str| {
            if a.trim().is_empty() {
                b.trim().to_string()
            } else {
                a.trim().to_string()
            }
        };
        let kubeconfig = expand_tilde(&or(&cluster.kubeconfig, &self.kubeconfig));
        let context = or(&cluster.context, &self.kube_context);
        let mut args = Vec::new();
        if !kubeconfig.is_empty() {
            args.extend(["--kubeconfig".to_string(), kubeconfig]);
        }
        if !context.is_empty() {
            args.extend(["--context".to_string(), context]);
        }
        args.extend([
            "version".to_string(),
            "--request-timeout=10s".to_string(),
            "-o".to_string(),
            "json".to_string(),
        ]);
        args
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubectlClusterClient {
    async fn check(&self, cluster: &ClusterTarget) -> Result<String, BackendError> {
        let spec = ProcessSpec {
            program: self.binary.to_string_lossy().to_string(),
            args: self.check_args(cluster),
            work_dir: None,
            env: Default::default(),
            timeout: Some(Duration::from_secs(30)),
        };
        let out = run_process(&spec, None)
            .await
            .map_err(|e| BackendError::new(format!("cluster {}: {}", cluster.name, e)))?;
        if !out.success() {
            return Err(BackendError::new(format!(
                "cluster {}: {}",
                cluster.name,
                out.failure_detail()
            )));
        }
        let version = serde_json::from_str::<serde_json::Value>(&out.stdout)
            .ok()
            .and_then(|v| {
                v.pointer("/serverVersion/gitVersion")
                    .and_then(|s| s.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "reachable".to_string());
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ResolvedRelease;
    use pretty_assertions::assert_eq;

    fn node() -> ResolvedRelease {
        let mut node = ResolvedRelease {
            id: "prod/apps/api".into(),
            name: "api".into(),
            chart: "/stack/charts/api".into(),
            chart_version: "1.2.3".into(),
            namespace: "apps".into(),
            values: vec!["/stack/values.yaml".into()],
            ..Default::default()
        };
        node.set.insert("image.tag".into(), "v2".into());
        node.cluster.context = "prod".into();
        node.apply.wait = Some(false);
        node
    }

    #[test]
    fn test_apply_args() {
        let node = node();
        let req = ReleaseRequest {
            node: &node,
            kubeconfig: "",
            kube_context: "",
            on_log: None,
        };
        assert_eq!(
            HelmBackend::apply_args(&req),
            vec![
                "upgrade", "--install", "api", "/stack/charts/api", "--version", "1.2.3",
                "--values", "/stack/values.yaml", "--set", "image.tag=v2", "--atomic",
                "--timeout", "300s", "--kube-context", "prod", "--namespace", "apps",
            ]
        );
    }

    #[test]
    fn test_delete_args_use_run_kubeconfig() {
        let node = node();
        let req = ReleaseRequest {
            node: &node,
            kubeconfig: "/tmp/kc",
            kube_context: "ignored",
            on_log: None,
        };
        assert_eq!(
            HelmBackend::delete_args(&req),
            vec![
                "uninstall", "api", "--wait", "--kubeconfig", "/tmp/kc", "--kube-context", "prod",
                "--namespace", "apps",
            ]
        );
    }

    #[test]
    fn test_cluster_check_args() {
        let client = KubectlClusterClient::new("/kc", "default-ctx");
        let cluster = ClusterTarget {
            name: "prod".into(),
            kubeconfig: String::new(),
            context: "prod".into(),
        };
        assert_eq!(
            client.check_args(&cluster),
            vec!["--kubeconfig", "/kc", "--context", "prod", "version", "--request-timeout=10s", "-o", "json"]
        );
    }
}
