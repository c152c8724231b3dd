// Runners Module
// Hook executors for script, kubectl and HTTP hooks

pub mod http;
pub mod kubectl;
pub mod process;
pub mod script;

pub use http::HttpRunner;
pub use kubectl::KubectlRunner;
pub use process::{run_process, ProcessOutput, ProcessSpec};
pub use script::ScriptRunner;

use crate::config::{HookSpec, HookType, StackCommand, DEFAULT_HOOK_TIMEOUT};

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single hook attempt
#[derive(Debug, Error)]
pub enum HookRunError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid hook: {0}")]
    Invalid(String),
}

/// Receives hook output one line at a time
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The release a node-scoped hook belongs to
#[derive(Debug, Clone, Default)]
pub struct HookRelease {
    pub id: String,
    pub name: String,
    pub dir: PathBuf,
    pub namespace: String,
    pub cluster: String,
    pub kubeconfig: String,
    pub context: String,
}

/// Everything a runner needs to know about where a hook runs
#[derive(Clone, Default)]
pub struct HookContext {
    pub stack_root: PathBuf,
    pub profile: String,
    pub run_id: String,
    pub command: Option<StackCommand>,
    /// Run-wide overrides from the CLI
    pub kubeconfig: String,
    pub kube_context: String,
    /// None for stack-scoped hooks
    pub release: Option<HookRelease>,
    /// Namespace shared by every plan node, used by stack-scoped kubectl hooks
    pub inferred_namespace: String,
    pub on_output: Option<OutputCallback>,
}

impl HookContext {
    /// Kubeconfig and context: hook, then release cluster, then run overrides
    pub fn kube_target(&self, hook: &HookSpec) -> (String, String) {
        let pick = |hook_val: &str, rel_val: Option<&str>, run_val: &str| {
            [Some(hook_val), rel_val, Some(run_val)]
                .into_iter()
                .flatten()
                .map(str::trim)
                .find(|v| !v.is_empty())
                .unwrap_or_default()
                .to_string()
        };
        let rel = self.release.as_ref();
        let kubeconfig = pick(
            &hook.kubeconfig,
            rel.map(|r| r.kubeconfig.as_str()),
            &self.kubeconfig,
        );
        let context = pick(
            &hook.context,
            rel.map(|r| r.context.as_str()),
            &self.kube_context,
        );
        (expand_tilde(&kubeconfig), context)
    }

    pub fn namespace(&self, hook: &HookSpec) -> String {
        if !hook.namespace.trim().is_empty() {
            return hook.namespace.trim().to_string();
        }
        match &self.release {
            Some(rel) => rel.namespace.trim().to_string(),
            None => self.inferred_namespace.clone(),
        }
    }

    /// Script workDir, else the release directory, else the stack root
    pub fn work_dir(&self, hook: &HookSpec) -> PathBuf {
        if let Some(dir) = hook
            .script
            .as_ref()
            .map(|s| s.work_dir.trim())
            .filter(|d| !d.is_empty())
        {
            return PathBuf::from(dir);
        }
        match &self.release {
            Some(rel) if !rel.dir.as_os_str().is_empty() => rel.dir.clone(),
            _ => self.stack_root.clone(),
        }
    }

    /// Environment added on top of the inherited process environment
    pub fn env(&self, hook: &HookSpec) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            "KTL_STACK_ROOT".to_string(),
            self.stack_root.to_string_lossy().to_string(),
        );
        env.insert("KTL_STACK_PROFILE".to_string(), self.profile.clone());
        env.insert("KTL_STACK_RUN_ID".to_string(), self.run_id.clone());
        env.insert(
            "KTL_STACK_COMMAND".to_string(),
            self.command.map(|c| c.as_str()).unwrap_or_default().to_string(),
        );
        let (kubeconfig, context) = self.kube_target(hook);
        if !kubeconfig.is_empty() {
            env.insert("KUBECONFIG".to_string(), kubeconfig);
        }
        if !context.is_empty() {
            env.insert("KUBE_CONTEXT".to_string(), context);
        }
        if let Some(rel) = &self.release {
            env.insert("KTL_RELEASE_ID".to_string(), rel.id.clone());
            env.insert("KTL_RELEASE_NAME".to_string(), rel.name.clone());
            env.insert(
                "KTL_RELEASE_DIR".to_string(),
                rel.dir.to_string_lossy().to_string(),
            );
            env.insert("KTL_RELEASE_NAMESPACE".to_string(), rel.namespace.clone());
            env.insert("KTL_CLUSTER_NAME".to_string(), rel.cluster.clone());
        }
        if let Some(script) = &hook.script {
            for (k, v) in &script.env {
                env.insert(k.clone(), v.clone());
            }
        }
        env
    }

    pub fn timeout(&self, hook: &HookSpec) -> Duration {
        hook.timeout.unwrap_or(DEFAULT_HOOK_TIMEOUT)
    }

    pub(crate) fn emit_output(&self, text: &str) {
        let Some(cb) = &self.on_output else {
            return;
        };
        for line in text.split(['\n', '\r']) {
            let line = line.trim_end();
            if !line.trim().is_empty() {
                cb(line);
            }
        }
    }
}

pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

/// Runs one attempt of a hook
#[async_trait::async_trait]
pub trait HookRunner: Send + Sync {
    async fn run(&self, hook: &HookSpec, ctx: &HookContext) -> Result<(), HookRunError>;
}

/// Dispatches each hook to the runner for its type
pub struct RunnerRegistry {
    script: ScriptRunner,
    kubectl: KubectlRunner,
    http: HttpRunner,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self {
            script: ScriptRunner::new(),
            kubectl: KubectlRunner::new(),
            http: HttpRunner::new(),
        }
    }

    /// Use a specific kubectl binary instead of the one on PATH
    pub fn with_kubectl(mut self, binary: impl Into<PathBuf>) -> Self {
        self.kubectl = KubectlRunner::with_binary(binary);
        self
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HookRunner for RunnerRegistry {
    async fn run(&self, hook: &HookSpec, ctx: &HookContext) -> Result<(), HookRunError> {
        match hook.hook_type {
            Some(HookType::Script) => self.script.run(hook, ctx).await,
            Some(HookType::Kubectl) => self.kubectl.run(hook, ctx).await,
            Some(HookType::Http) => self.http.run(hook, ctx).await,
            None => Err(HookRunError::Invalid("hook type is required".into())),
        }
    }
}
