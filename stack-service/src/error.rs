// Service Errors
// Top-level error taxonomy for stack orchestration

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::runners::HookRunError;
use crate::stack::graph::GraphError;
use crate::state::StoreError;

use sha2::{Digest, Sha256};
use std::io;
use thiserror::Error;

/// Result alias used across the service crate
pub type StackResult<T> = Result<T, StackError>;

/// Errors surfaced by the orchestration engine
#[derive(Debug, Error)]
pub enum StackError {
    /// Malformed stack or release configuration
    #[error("{0}")]
    Validation(String),

    /// Config file could not be read or parsed
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unknown or cyclic `needs`
    #[error("{0}")]
    Dependency(String),

    /// A hook exhausted its attempts
    #[error("hook {phase} {hook} failed: {message}")]
    Hook {
        hook: String,
        phase: String,
        message: String,
    },

    /// The deploy backend failed an install/upgrade
    #[error("{node}: apply failed: {message}")]
    Apply { node: String, message: String },

    /// The deploy backend failed an uninstall
    #[error("{node}: delete failed: {message}")]
    Delete { node: String, message: String },

    /// Hash chain or run digest mismatch
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Nodes are pending but nothing can make progress
    #[error("scheduler deadlock: {} node(s) pending with no runnable work ({})", pending.len(), pending.join(", "))]
    SchedulerDeadlock { pending: Vec<String> },

    /// State store failure (fatal for a live run)
    #[error("state store: {0}")]
    Store(#[from] StoreError),

    /// The run was cancelled before completion
    #[error("run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StackError {
    /// Stable class string recorded in `RunError.class`
    pub fn class(&self) -> &'static str {
        match self {
            StackError::Validation(_) | StackError::Config(_) => "VALIDATION",
            StackError::Dependency(_) => "DEPENDENCY",
            StackError::Hook { .. } => "HOOK_FAILED",
            StackError::Apply { .. } => "APPLY_FAILED",
            StackError::Delete { .. } => "DELETE_FAILED",
            StackError::Integrity(_) => "INTEGRITY",
            StackError::SchedulerDeadlock { .. } => "SCHEDULER_DEADLOCK",
            StackError::Store(_) => "STORE",
            StackError::Cancelled => "CANCELLED",
            StackError::Io(_) => "IO",
        }
    }

    /// Whether the failure is fatal for the whole run rather than one node
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StackError::SchedulerDeadlock { .. } | StackError::Store(_)
        )
    }

    /// Text that identifies the cause independently of the failing node
    ///
    /// Releases that hit the same backend error share a digest, so failure
    /// clustering can group them.
    pub fn root_cause(&self) -> String {
        match self {
            StackError::Apply { message, .. } | StackError::Delete { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    pub(crate) fn from_backend(node: &str, command: &str, err: &BackendError) -> Self {
        if command == "delete" {
            StackError::Delete {
                node: node.to_string(),
                message: err.message.clone(),
            }
        } else {
            StackError::Apply {
                node: node.to_string(),
                message: err.message.clone(),
            }
        }
    }

    pub(crate) fn from_hook(hook: &str, phase: &str, err: &HookRunError) -> Self {
        StackError::Hook {
            hook: hook.to_string(),
            phase: phase.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<GraphError> for StackError {
    fn from(err: GraphError) -> Self {
        StackError::Dependency(err.message)
    }
}

/// Digest that lets failure clustering group identical root causes
pub fn error_digest(class: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(class.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(message.trim().as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_digest_is_stable_and_class_scoped() {
        let a = error_digest("APPLY_FAILED", "boom");
        let b = error_digest("APPLY_FAILED", "boom");
        let c = error_digest("HOOK_FAILED", "boom");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("sha256:"));
        assert_eq!(a.len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_error_classes() {
        let err = StackError::SchedulerDeadlock {
            pending: vec!["c/ns/a".into(), "c/ns/b".into()],
        };
        assert_eq!(err.class(), "SCHEDULER_DEADLOCK");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("2 node(s) pending"));

        let err = StackError::Apply {
            node: "c/ns/a".into(),
            message: "timeout".into(),
        };
        assert_eq!(err.class(), "APPLY_FAILED");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_root_cause_drops_node_prefix() {
        let a = StackError::Apply {
            node: "c/ns/a".into(),
            message: "exceeded quota: pods".into(),
        };
        let b = StackError::Apply {
            node: "c/ns/b".into(),
            message: "exceeded quota: pods".into(),
        };
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.root_cause(), b.root_cause());
        assert_eq!(StackError::Cancelled.root_cause(), "run cancelled");
    }
}
