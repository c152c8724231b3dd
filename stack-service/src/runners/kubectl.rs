// Kubectl Runner
// Runs kubectl against the hook's resolved cluster and namespace

use super::process::{run_process, ProcessSpec};
use super::{HookContext, HookRunError, HookRunner};
use crate::config::HookSpec;

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct KubectlRunner {
    binary: PathBuf,
}

impl KubectlRunner {
    /// Uses `kubectl` from PATH
    pub fn new() -> Self {
        let binary = which::which("kubectl").unwrap_or_else(|_| PathBuf::from("kubectl"));
        Self { binary }
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Connection flags first, then the hook's own args
    pub fn build_args(hook: &HookSpec, ctx: &HookContext) -> Vec<String> {
        let user_args = hook
            .kubectl
            .as_ref()
            .map(|k| k.args.as_slice())
            .unwrap_or_default();
        let (kubeconfig, context) = ctx.kube_target(hook);
        let mut args = Vec::with_capacity(user_args.len() + 6);
        if !kubeconfig.is_empty() {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig);
        }
        if !context.is_empty() {
            args.push("--context".to_string());
            args.push(context);
        }
        let namespace = ctx.namespace(hook);
        if !namespace.is_empty() && !has_namespace_flag(user_args) {
            args.push("-n".to_string());
            args.push(namespace);
        }
        args.extend(user_args.iter().cloned());
        args
    }
}

impl Default for KubectlRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn has_namespace_flag(args: &[String]) -> bool {
    args.iter().any(|a| {
        let a = a.trim();
        a == "-n" || a == "--namespace" || a.starts_with("--namespace=") || a.starts_with("-n=")
    })
}

#[async_trait::async_trait]
impl HookRunner for KubectlRunner {
    async fn run(&self, hook: &HookSpec, ctx: &HookContext) -> Result<(), HookRunError> {
        let user_args = hook
            .kubectl
            .as_ref()
            .map(|k| k.args.as_slice())
            .unwrap_or_default();
        if user_args.is_empty() {
            return Err(HookRunError::Invalid("kubectl.args is required".into()));
        }

        let spec = ProcessSpec {
            program: self.binary.to_string_lossy().to_string(),
            args: Self::build_args(hook, ctx),
            work_dir: None,
            env: Default::default(),
            timeout: Some(ctx.timeout(hook)),
        };
        let label = user_args.join(" ");
        let out = run_process(&spec, ctx.on_output.clone())
            .await
            .map_err(|e| HookRunError::Failed(format!("kubectl {}: {}", label, e)))?;
        if !out.success() {
            return Err(HookRunError::Failed(format!(
                "kubectl {}: {}",
                label,
                out.failure_detail()
            )));
        }
        Ok(())
    }
}
