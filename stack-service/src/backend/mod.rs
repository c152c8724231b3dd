// Deploy backend
// Seams to the tools that actually mutate and inspect clusters

pub mod helm;

pub use helm::{HelmBackend, KubectlClusterClient};

use crate::config::ClusterTarget;
use crate::runners::OutputCallback;
use crate::stack::ResolvedRelease;

use thiserror::Error;

/// Failure reported by a backend call
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// Safe to retry the whole node (network blips, API throttling)
    pub transient: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let transient = looks_transient(&message);
        Self { message, transient }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "tls handshake timeout",
    "too many requests",
    "the server is currently unable to handle the request",
    "etcdserver: request timed out",
    "unexpected eof",
    "context deadline exceeded",
];

fn looks_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Where and how a node's release should be installed or removed
#[derive(Clone)]
pub struct ReleaseRequest<'a> {
    pub node: &'a ResolvedRelease,
    /// Run-wide fallbacks when the node's cluster leaves them empty
    pub kubeconfig: &'a str,
    pub kube_context: &'a str,
    pub on_log: Option<OutputCallback>,
}

impl ReleaseRequest<'_> {
    /// Kubeconfig and context: node cluster first, then run overrides
    pub fn kube_target(&self) -> (String, String) {
        let pick = |node_val: &str, run_val: &str| {
            let v = node_val.trim();
            if v.is_empty() {
                run_val.trim().to_string()
            } else {
                v.to_string()
            }
        };
        (
            crate::runners::expand_tilde(&pick(&self.node.cluster.kubeconfig, self.kubeconfig)),
            pick(&self.node.cluster.context, self.kube_context),
        )
    }
}

/// Result of a successful install or upgrade
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Rendered manifest as deployed
    pub manifest: String,
    /// Backend fingerprint of live state after the apply, if it can observe one
    pub observed_digest: Option<String>,
}

/// Install/upgrade and uninstall of one release
#[async_trait::async_trait]
pub trait DeployBackend: Send + Sync {
    async fn apply(&self, req: &ReleaseRequest<'_>) -> Result<ApplyOutcome, BackendError>;

    async fn delete(&self, req: &ReleaseRequest<'_>) -> Result<(), BackendError>;

    /// Fingerprint of what is live right now; None when the backend cannot tell
    async fn observed_digest(&self, _req: &ReleaseRequest<'_>) -> Result<Option<String>, BackendError> {
        Ok(None)
    }
}

/// Connectivity probe run before a stack touches a cluster
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Returns a short description of the server on success
    async fn check(&self, cluster: &ClusterTarget) -> Result<String, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_transient_detection() {
        assert!(BackendError::new("dial tcp 10.0.0.1:443: connection refused").transient);
        assert!(BackendError::new("Error: Too Many Requests").transient);
        assert!(!BackendError::new("chart \"x\" not found").transient);
    }

    #[test]
    fn test_release_request_prefers_node_cluster() {
        let mut node = ResolvedRelease::default();
        node.cluster.context = "node-ctx".into();
        let req = ReleaseRequest {
            node: &node,
            kubeconfig: "/run/kc",
            kube_context: "run-ctx",
            on_log: None,
        };
        assert_eq!(
            req.kube_target(),
            ("/run/kc".to_string(), "node-ctx".to_string())
        );
    }
}
