// Stack configuration models
// serde types for stack.yaml and release.yaml

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// apiVersion accepted in stack.yaml / release.yaml
pub const CONFIG_API_VERSION: &str = "ktl.dev/v1";

/// The two mutating stack commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackCommand {
    Apply,
    Delete,
}

impl StackCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackCommand::Apply => "apply",
            StackCommand::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apply" => Some(StackCommand::Apply),
            "delete" => Some(StackCommand::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for StackCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target cluster for a release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterTarget {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kubeconfig: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context: String,
}

/// Options forwarded to install/upgrade
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplyOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atomic: Option<bool>,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_namespace: Option<bool>,
}

/// Options forwarded to uninstall
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteOptions {
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

/// Defaults inherited by every release under a stack.yaml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseDefaults {
    pub cluster: ClusterTarget,
    pub namespace: String,
    pub values: Vec<String>,
    pub set: BTreeMap<String, String>,
    pub apply: ApplyOptions,
    pub delete: DeleteOptions,
    pub tags: Vec<String>,
}

/// Lifecycle phase a hook is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    PreApply,
    PostApply,
    PreDelete,
    PostDelete,
}

impl HookPhase {
    pub const ALL: [HookPhase; 4] = [
        HookPhase::PreApply,
        HookPhase::PostApply,
        HookPhase::PreDelete,
        HookPhase::PostDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::PreApply => "pre-apply",
            HookPhase::PostApply => "post-apply",
            HookPhase::PreDelete => "pre-delete",
            HookPhase::PostDelete => "post-delete",
        }
    }

    pub fn is_pre(&self) -> bool {
        matches!(self, HookPhase::PreApply | HookPhase::PreDelete)
    }

    pub fn command(&self) -> StackCommand {
        match self {
            HookPhase::PreApply | HookPhase::PostApply => StackCommand::Apply,
            HookPhase::PreDelete | HookPhase::PostDelete => StackCommand::Delete,
        }
    }

    /// Phase that wraps `command` on the given side
    pub fn for_command(command: StackCommand, pre: bool) -> Self {
        match (command, pre) {
            (StackCommand::Apply, true) => HookPhase::PreApply,
            (StackCommand::Apply, false) => HookPhase::PostApply,
            (StackCommand::Delete, true) => HookPhase::PreDelete,
            (StackCommand::Delete, false) => HookPhase::PostDelete,
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution kind of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookType {
    Kubectl,
    Script,
    Http,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::Kubectl => "kubectl",
            HookType::Script => "script",
            HookType::Http => "http",
        }
    }
}

/// When a hook fires relative to the outcome of what it wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookWhen {
    Success,
    Failure,
    Always,
}

impl HookWhen {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookWhen::Success => "success",
            HookWhen::Failure => "failure",
            HookWhen::Always => "always",
        }
    }

    pub fn matches(&self, succeeded: bool) -> bool {
        match self {
            HookWhen::Always => true,
            HookWhen::Success => succeeded,
            HookWhen::Failure => !succeeded,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubectlHookConfig {
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptHookConfig {
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub work_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpHookConfig {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
}

impl HttpHookConfig {
    /// POST when a body is present, GET otherwise
    pub fn effective_method(&self) -> String {
        let method = self.method.trim();
        if !method.is_empty() {
            return method.to_ascii_uppercase();
        }
        if self.body.trim().is_empty() {
            "GET".to_string()
        } else {
            "POST".to_string()
        }
    }
}

/// A single hook definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HookSpec {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub hook_type: Option<HookType>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub run_once: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<HookWhen>,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Max attempts, including the first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kubeconfig: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubectl: Option<KubectlHookConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<ScriptHookConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpHookConfig>,
}

impl HookSpec {
    /// Name used in events: explicit name, else the type, else "hook"
    pub fn display_name(&self) -> String {
        let name = self.name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
        self.hook_type
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "hook".to_string())
    }

    pub fn type_str(&self) -> &'static str {
        self.hook_type.map(|t| t.as_str()).unwrap_or("")
    }

    /// `when` with the phase default applied
    pub fn effective_when(&self, phase: HookPhase) -> HookWhen {
        self.when.unwrap_or(if phase.is_pre() {
            HookWhen::Always
        } else {
            HookWhen::Success
        })
    }

    /// Short one-line description of what the hook runs
    pub fn summary(&self) -> String {
        match self.hook_type {
            Some(HookType::Script) => match &self.script {
                Some(script) if !script.command.is_empty() => {
                    let mut parts: Vec<&str> =
                        script.command.iter().take(8).map(String::as_str).collect();
                    if script.command.len() > 8 {
                        parts.push("…");
                    }
                    parts.join(" ")
                }
                _ => String::new(),
            },
            Some(HookType::Kubectl) => match &self.kubectl {
                Some(kubectl) if !kubectl.args.is_empty() => {
                    let mut parts: Vec<&str> =
                        kubectl.args.iter().take(10).map(String::as_str).collect();
                    if kubectl.args.len() > 10 {
                        parts.push("…");
                    }
                    format!("kubectl {}", parts.join(" "))
                }
                _ => String::new(),
            },
            Some(HookType::Http) => match &self.http {
                Some(http) if !http.url.trim().is_empty() => {
                    format!("{} {}", http.effective_method(), http.url.trim())
                }
                _ => String::new(),
            },
            None => String::new(),
        }
    }

    /// Validate one hook; `location` prefixes error messages
    pub fn validate(&self, allow_run_once: bool, location: &str) -> Result<(), String> {
        if self.run_once && !allow_run_once {
            return Err(format!(
                "{}: runOnce is not allowed here (only the root stack.yaml hooks can use runOnce)",
                location
            ));
        }
        match self.hook_type {
            None => {
                return Err(format!(
                    "{}: hook type is required (kubectl|script|http)",
                    location
                ))
            }
            Some(HookType::Kubectl) => {
                if self.kubectl.as_ref().map_or(true, |k| k.args.is_empty()) {
                    return Err(format!("{}: kubectl hook requires kubectl.args", location));
                }
            }
            Some(HookType::Script) => {
                if self.script.as_ref().map_or(true, |s| s.command.is_empty()) {
                    return Err(format!("{}: script hook requires script.command", location));
                }
            }
            Some(HookType::Http) => {
                if self.http.as_ref().map_or(true, |h| h.url.trim().is_empty()) {
                    return Err(format!("{}: http hook requires http.url", location));
                }
            }
        }
        if let Some(retry) = self.retry {
            if retry < 1 {
                return Err(format!("{}: retry must be >= 1 (got {})", location, retry));
            }
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(format!("{}: timeout must be > 0", location));
            }
        }
        Ok(())
    }
}

/// Hooks grouped by phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HooksConfig {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pre_apply: Vec<HookSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_apply: Vec<HookSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pre_delete: Vec<HookSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_delete: Vec<HookSpec>,
}

impl HooksConfig {
    pub fn for_phase(&self, phase: HookPhase) -> &[HookSpec] {
        match phase {
            HookPhase::PreApply => &self.pre_apply,
            HookPhase::PostApply => &self.post_apply,
            HookPhase::PreDelete => &self.pre_delete,
            HookPhase::PostDelete => &self.post_delete,
        }
    }

    pub fn for_phase_mut(&mut self, phase: HookPhase) -> &mut Vec<HookSpec> {
        match phase {
            HookPhase::PreApply => &mut self.pre_apply,
            HookPhase::PostApply => &mut self.post_apply,
            HookPhase::PreDelete => &mut self.pre_delete,
            HookPhase::PostDelete => &mut self.post_delete,
        }
    }

    pub fn is_empty(&self) -> bool {
        HookPhase::ALL.iter().all(|p| self.for_phase(*p).is_empty())
    }

    /// Whether any pre/post hook wraps `command`
    pub fn has_hooks_for(&self, command: StackCommand) -> bool {
        !self.for_phase(HookPhase::for_command(command, true)).is_empty()
            || !self.for_phase(HookPhase::for_command(command, false)).is_empty()
    }

    /// Append every phase list of `other`
    pub fn extend(&mut self, other: &HooksConfig) {
        for phase in HookPhase::ALL {
            self.for_phase_mut(phase)
                .extend(other.for_phase(phase).iter().cloned());
        }
    }

    /// Keep only hooks whose `runOnce` equals `run_once`
    pub fn filter_run_once(&self, run_once: bool) -> HooksConfig {
        let mut out = HooksConfig::default();
        for phase in HookPhase::ALL {
            *out.for_phase_mut(phase) = self
                .for_phase(phase)
                .iter()
                .filter(|h| h.run_once == run_once)
                .cloned()
                .collect();
        }
        out
    }

    pub fn validate(&self, allow_run_once: bool, location: &str) -> Result<(), String> {
        for phase in HookPhase::ALL {
            let key = match phase {
                HookPhase::PreApply => "preApply",
                HookPhase::PostApply => "postApply",
                HookPhase::PreDelete => "preDelete",
                HookPhase::PostDelete => "postDelete",
            };
            for hook in self.for_phase(phase) {
                hook.validate(allow_run_once, &format!("{}.{}", location, key))?;
            }
        }
        Ok(())
    }
}

/// Node-level and hook-level retry knobs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HookRetryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Duration>,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_backoff: Option<Duration>,
}

/// `runner:` block of stack.yaml
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    pub concurrency: Option<usize>,
    pub progressive_concurrency: Option<bool>,
    pub max_parallel_per_namespace: Option<usize>,
    pub max_attempts: Option<u32>,
    pub hook_retry: HookRetryConfig,
}

/// Default selection constraints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectorConfig {
    pub clusters: Vec<String>,
    pub tags: Vec<String>,
    pub from_paths: Vec<String>,
    pub releases: Vec<String>,
    pub git_range: String,
    pub include_deps: Option<bool>,
    pub include_dependents: Option<bool>,
    pub allow_missing_deps: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockConfig {
    pub enabled: Option<bool>,
    pub takeover: Option<bool>,
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunCliConfig {
    pub fail_fast: Option<bool>,
    pub retry: Option<u32>,
    pub lock: LockConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResumeCliConfig {
    pub allow_drift: Option<bool>,
    pub rerun_failed: Option<bool>,
}

/// `cli:` block of stack.yaml
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CliConfig {
    pub selector: SelectorConfig,
    pub output: Option<String>,
    pub apply: RunCliConfig,
    pub delete: RunCliConfig,
    pub resume: ResumeCliConfig,
}

/// Named overlay selected with --profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackProfile {
    pub defaults: ReleaseDefaults,
    pub runner: RunnerConfig,
    pub cli: CliConfig,
    pub hooks: HooksConfig,
}

/// A release declared inline in stack.yaml or in its own release.yaml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseSpec {
    pub name: String,
    pub chart: String,
    pub chart_version: String,
    pub parallelism_group: String,
    pub critical: bool,
    pub cluster: ClusterTarget,
    pub namespace: String,
    pub values: Vec<String>,
    pub set: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub needs: Vec<String>,
    pub apply: ApplyOptions,
    pub delete: DeleteOptions,
    pub hooks: HooksConfig,
}

/// stack.yaml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StackFile {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub default_profile: String,
    pub profiles: BTreeMap<String, StackProfile>,
    pub defaults: ReleaseDefaults,
    pub runner: RunnerConfig,
    pub cli: CliConfig,
    pub hooks: HooksConfig,
    pub releases: Vec<ReleaseSpec>,
}

/// release.yaml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReleaseFile {
    pub api_version: String,
    pub kind: String,
    #[serde(flatten)]
    pub release: ReleaseSpec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stack_file() {
        let yaml = r#"
apiVersion: ktl.dev/v1
kind: Stack
name: platform
defaultProfile: dev
defaults:
  cluster:
    name: prod
  namespace: apps
  apply:
    timeout: 10m
    atomic: true
profiles:
  dev:
    defaults:
      namespace: apps-dev
runner:
  concurrency: 4
  hookRetry:
    backoff: 1s
hooks:
  preApply:
    - name: announce
      type: script
      runOnce: true
      retry: 2
      script:
        command: ["./notify.sh", "start"]
releases:
  - name: api
    chart: ./charts/api
    needs: [db]
"#;
        let sf: StackFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(sf.name, "platform");
        assert_eq!(sf.defaults.apply.timeout, Some(Duration::from_secs(600)));
        assert_eq!(sf.defaults.apply.atomic, Some(true));
        assert_eq!(sf.profiles["dev"].defaults.namespace, "apps-dev");
        assert_eq!(sf.runner.concurrency, Some(4));
        assert_eq!(sf.runner.hook_retry.backoff, Some(Duration::from_secs(1)));
        let hook = &sf.hooks.pre_apply[0];
        assert_eq!(hook.hook_type, Some(HookType::Script));
        assert!(hook.run_once);
        assert_eq!(hook.retry, Some(2));
        assert_eq!(hook.summary(), "./notify.sh start");
        assert_eq!(sf.releases[0].needs, vec!["db".to_string()]);
    }

    #[test]
    fn test_parse_release_file_flattened() {
        let yaml = r#"
apiVersion: ktl.dev/v1
kind: Release
name: db
chart: oci://registry/charts/postgres
chartVersion: 1.2.3
tags: [data]
set:
  replicas: "2"
"#;
        let rf: ReleaseFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rf.kind, "Release");
        assert_eq!(rf.release.name, "db");
        assert_eq!(rf.release.chart_version, "1.2.3");
        assert_eq!(rf.release.set.get("replicas"), Some(&"2".to_string()));
    }

    #[test]
    fn test_hook_validation() {
        let mut hook = HookSpec {
            hook_type: Some(HookType::Kubectl),
            ..Default::default()
        };
        assert!(hook
            .validate(false, "hooks.preApply")
            .unwrap_err()
            .contains("kubectl.args"));

        hook.kubectl = Some(KubectlHookConfig {
            args: vec!["apply".into(), "-f".into(), "job.yaml".into()],
        });
        assert!(hook.validate(false, "hooks.preApply").is_ok());

        hook.retry = Some(0);
        assert!(hook.validate(false, "x").unwrap_err().contains("retry"));

        hook.retry = None;
        hook.run_once = true;
        assert!(hook.validate(false, "x").unwrap_err().contains("runOnce"));
        assert!(hook.validate(true, "x").is_ok());
    }

    #[test]
    fn test_effective_when_defaults() {
        let hook = HookSpec::default();
        assert_eq!(hook.effective_when(HookPhase::PreApply), HookWhen::Always);
        assert_eq!(hook.effective_when(HookPhase::PostDelete), HookWhen::Success);
        assert!(HookWhen::Failure.matches(false));
        assert!(!HookWhen::Success.matches(false));
    }

    #[test]
    fn test_http_summary_method_default() {
        let hook = HookSpec {
            hook_type: Some(HookType::Http),
            http: Some(HttpHookConfig {
                url: "https://hooks.example/deploy".into(),
                body: "{}".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(hook.summary(), "POST https://hooks.example/deploy");
        assert_eq!(hook.display_name(), "http");
    }

    #[test]
    fn test_hooks_config_helpers() {
        let mut hooks = HooksConfig::default();
        assert!(hooks.is_empty());
        hooks.post_apply.push(HookSpec {
            name: "smoke".into(),
            ..Default::default()
        });
        hooks.pre_apply.push(HookSpec {
            name: "once".into(),
            run_once: true,
            ..Default::default()
        });
        assert!(hooks.has_hooks_for(StackCommand::Apply));
        assert!(!hooks.has_hooks_for(StackCommand::Delete));
        let once = hooks.filter_run_once(true);
        assert_eq!(once.pre_apply.len(), 1);
        assert!(once.post_apply.is_empty());
    }
}
