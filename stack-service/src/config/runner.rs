// Runner settings
// Resolves runner:/cli: blocks from the root stack.yaml and the active profile

use super::discovery::Universe;
use super::error::{ConfigError, ConfigResult};
use super::models::{
    CliConfig, HookRetryConfig, HookSpec, LockConfig, RunCliConfig, RunnerConfig, SelectorConfig,
    StackCommand,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default per-attempt hook timeout
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default stack lock ttl
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

/// How a node failure propagates to the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailMode {
    #[default]
    FailFast,
    Continue,
}

impl FailMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailMode::FailFast => "fail-fast",
            FailMode::Continue => "continue",
        }
    }

    pub fn from_fail_fast(fail_fast: bool) -> Self {
        if fail_fast {
            FailMode::FailFast
        } else {
            FailMode::Continue
        }
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded retry for hooks: attempt count and linear backoff between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRetryPolicy {
    /// Attempts used when a hook does not set `retry`
    pub default_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for HookRetryPolicy {
    fn default() -> Self {
        Self {
            default_attempts: 1,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl HookRetryPolicy {
    /// Max attempts for a hook, including the first
    pub fn attempts_for(&self, hook: &HookSpec) -> u32 {
        hook.retry.unwrap_or(self.default_attempts).max(1)
    }

    /// Wait before the attempt after `failed_attempt` (1-based)
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(failed_attempt.max(1))
            .min(self.max_backoff)
    }

    fn apply(&mut self, cfg: &HookRetryConfig) {
        if let Some(attempts) = cfg.attempts {
            self.default_attempts = attempts;
        }
        if let Some(backoff) = cfg.backoff {
            self.base_backoff = backoff;
        }
        if let Some(max_backoff) = cfg.max_backoff {
            self.max_backoff = max_backoff;
        }
    }
}

/// Resolved scheduler settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub concurrency: usize,
    pub progressive_concurrency: bool,
    /// 0 = unlimited
    pub max_parallel_per_namespace: usize,
    pub fail_mode: FailMode,
    /// Node-level attempts; only transient backend errors are retried
    pub max_attempts: u32,
    pub hook_retry: HookRetryPolicy,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            progressive_concurrency: false,
            max_parallel_per_namespace: 0,
            fail_mode: FailMode::FailFast,
            max_attempts: 1,
            hook_retry: HookRetryPolicy::default(),
        }
    }
}

/// Worker budget when nothing is configured
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl RunnerSettings {
    /// Overlay one runner: block onto the settings
    pub fn apply_config(&mut self, cfg: &RunnerConfig) {
        if let Some(c) = cfg.concurrency {
            self.concurrency = c;
        }
        if let Some(p) = cfg.progressive_concurrency {
            self.progressive_concurrency = p;
        }
        if let Some(n) = cfg.max_parallel_per_namespace {
            self.max_parallel_per_namespace = n;
        }
        if let Some(a) = cfg.max_attempts {
            self.max_attempts = a;
        }
        self.hook_retry.apply(&cfg.hook_retry);
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.concurrency < 1 {
            return Err(ConfigError::validation(format!(
                "runner.concurrency must be >= 1 (got {})",
                self.concurrency
            )));
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::validation(format!(
                "runner.maxAttempts must be >= 1 (got {})",
                self.max_attempts
            )));
        }
        if self.hook_retry.default_attempts < 1 {
            return Err(ConfigError::validation(format!(
                "runner.hookRetry.attempts must be >= 1 (got {})",
                self.hook_retry.default_attempts
            )));
        }
        if self.hook_retry.max_backoff < self.hook_retry.base_backoff {
            return Err(ConfigError::validation(
                "runner.hookRetry.maxBackoff must be >= runner.hookRetry.backoff",
            ));
        }
        Ok(())
    }
}

/// Runner settings from the root stack.yaml then the profile
pub fn resolve_runner_settings(u: &Universe, profile: &str) -> ConfigResult<RunnerSettings> {
    let mut settings = RunnerSettings::default();
    if let Some(root) = u.root_stack() {
        settings.apply_config(&root.runner);
    }
    if let Some(profile) = u.root_profile(profile) {
        settings.apply_config(&profile.runner);
    }
    settings.validate().map_err(|e| e.with_path(&u.root_dir))?;
    Ok(settings)
}

/// cli: block from the root stack.yaml with the profile overlaid
pub fn resolve_cli_config(u: &Universe, profile: &str) -> ConfigResult<CliConfig> {
    let mut out = CliConfig::default();
    if let Some(root) = u.root_stack() {
        merge_cli(&mut out, &root.cli);
    }
    if let Some(profile) = u.root_profile(profile) {
        merge_cli(&mut out, &profile.cli);
    }
    if let Some(output) = &out.output {
        let normalized = output.trim().to_ascii_lowercase();
        if normalized != "table" && normalized != "json" {
            return Err(ConfigError::validation(format!(
                "cli.output must be table|json (got {:?})",
                output
            )));
        }
        out.output = Some(normalized);
    }
    Ok(out)
}

impl CliConfig {
    /// Per-command block
    pub fn for_command(&self, command: StackCommand) -> &RunCliConfig {
        match command {
            StackCommand::Apply => &self.apply,
            StackCommand::Delete => &self.delete,
        }
    }
}

fn merge_cli(dst: &mut CliConfig, src: &CliConfig) {
    merge_selector(&mut dst.selector, &src.selector);
    if src.output.is_some() {
        dst.output = src.output.clone();
    }
    merge_run_cli(&mut dst.apply, &src.apply);
    merge_run_cli(&mut dst.delete, &src.delete);
    if src.resume.allow_drift.is_some() {
        dst.resume.allow_drift = src.resume.allow_drift;
    }
    if src.resume.rerun_failed.is_some() {
        dst.resume.rerun_failed = src.resume.rerun_failed;
    }
}

fn merge_selector(dst: &mut SelectorConfig, src: &SelectorConfig) {
    if !src.clusters.is_empty() {
        dst.clusters = src.clusters.clone();
    }
    if !src.tags.is_empty() {
        dst.tags = src.tags.clone();
    }
    if !src.from_paths.is_empty() {
        dst.from_paths = src.from_paths.clone();
    }
    if !src.releases.is_empty() {
        dst.releases = src.releases.clone();
    }
    if !src.git_range.trim().is_empty() {
        dst.git_range = src.git_range.clone();
    }
    if src.include_deps.is_some() {
        dst.include_deps = src.include_deps;
    }
    if src.include_dependents.is_some() {
        dst.include_dependents = src.include_dependents;
    }
    if src.allow_missing_deps.is_some() {
        dst.allow_missing_deps = src.allow_missing_deps;
    }
}

fn merge_run_cli(dst: &mut RunCliConfig, src: &RunCliConfig) {
    if src.fail_fast.is_some() {
        dst.fail_fast = src.fail_fast;
    }
    if src.retry.is_some() {
        dst.retry = src.retry;
    }
    merge_lock(&mut dst.lock, &src.lock);
}

fn merge_lock(dst: &mut LockConfig, src: &LockConfig) {
    if src.enabled.is_some() {
        dst.enabled = src.enabled;
    }
    if src.takeover.is_some() {
        dst.takeover = src.takeover;
    }
    if src.ttl.is_some() {
        dst.ttl = src.ttl;
    }
    if src.owner.is_some() {
        dst.owner = src.owner.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::discovery::discover;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_hook_backoff_is_linear_and_capped() {
        let policy = HookRetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1500));
        assert_eq!(policy.backoff(100), Duration::from_secs(10));
    }

    #[test]
    fn test_attempts_for_prefers_hook_retry() {
        let policy = HookRetryPolicy {
            default_attempts: 3,
            ..Default::default()
        };
        let mut hook = HookSpec::default();
        assert_eq!(policy.attempts_for(&hook), 3);
        hook.retry = Some(2);
        assert_eq!(policy.attempts_for(&hook), 2);
    }

    #[test]
    fn test_profile_overrides_root_runner() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("stack.yaml"),
            r#"
runner:
  concurrency: 2
  hookRetry:
    attempts: 2
profiles:
  ci:
    runner:
      concurrency: 6
      maxParallelPerNamespace: 1
    cli:
      output: JSON
      apply:
        failFast: false
"#,
        )
        .unwrap();
        let u = discover(tmp.path()).unwrap();

        let base = resolve_runner_settings(&u, "").unwrap();
        assert_eq!(base.concurrency, 2);
        assert_eq!(base.hook_retry.default_attempts, 2);

        let ci = resolve_runner_settings(&u, "ci").unwrap();
        assert_eq!(ci.concurrency, 6);
        assert_eq!(ci.max_parallel_per_namespace, 1);
        assert_eq!(ci.hook_retry.default_attempts, 2);

        let cli = resolve_cli_config(&u, "ci").unwrap();
        assert_eq!(cli.output.as_deref(), Some("json"));
        assert_eq!(cli.for_command(StackCommand::Apply).fail_fast, Some(false));
    }

    #[test]
    fn test_invalid_concurrency_rejected() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("stack.yaml"), "runner:\n  concurrency: 0\n").unwrap();
        let u = discover(tmp.path()).unwrap();
        let err = resolve_runner_settings(&u, "").unwrap_err();
        assert!(err.message.contains("runner.concurrency must be >= 1"));
    }
}
