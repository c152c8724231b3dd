// Hook Engine
// Runs a phase's hooks in order with bounded retries, reporting each step as events

use super::events::{EventType, Fields, RunError};
use super::recorder::RunRecorder;
use crate::config::{HookPhase, HookRetryPolicy, HookSpec, HooksConfig, StackCommand};
use crate::error::{StackError, StackResult};
use crate::runners::{HookContext, HookRelease, HookRunner, OutputCallback};
use crate::stack::ResolvedRelease;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome the hooks of a phase are evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    Success,
    Failure,
}

impl HookStatus {
    pub fn from_ok(ok: bool) -> Self {
        if ok {
            HookStatus::Success
        } else {
            HookStatus::Failure
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookStatus::Success => "success",
            HookStatus::Failure => "failure",
        }
    }
}

pub struct HookEngine {
    runner: Arc<dyn HookRunner>,
    policy: HookRetryPolicy,
    recorder: Arc<RunRecorder>,
    /// Run-wide context; release details are filled in per node
    base: HookContext,
    /// Checked between attempts; the attempt in flight always finishes
    cancel: CancellationToken,
}

fn hook_fields(hook: &HookSpec, phase: HookPhase) -> Fields {
    Fields::new()
        .set("hook", hook.display_name())
        .set("phase", phase.as_str())
        .set("when", hook.effective_when(phase).as_str())
        .set("runOnce", hook.run_once)
        .set("type", hook.type_str())
        .set("summary", hook.summary())
}

impl HookEngine {
    pub fn new(
        runner: Arc<dyn HookRunner>,
        policy: HookRetryPolicy,
        recorder: Arc<RunRecorder>,
        base: HookContext,
    ) -> Self {
        Self {
            runner,
            policy,
            recorder,
            base,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn command(&self) -> Option<StackCommand> {
        self.base.command
    }

    fn context_for(&self, node: Option<&ResolvedRelease>, on_output: OutputCallback) -> HookContext {
        let mut ctx = self.base.clone();
        ctx.release = node.map(|n| HookRelease {
            id: n.id.clone(),
            name: n.name.clone(),
            dir: n.dir.clone(),
            namespace: n.namespace.clone(),
            cluster: n.cluster.name.clone(),
            kubeconfig: n.cluster.kubeconfig.clone(),
            context: n.cluster.context.clone(),
        });
        ctx.on_output = Some(on_output);
        ctx
    }

    /// Run every hook of `phase` in declaration order
    ///
    /// Hooks whose `when` does not match `status` are reported as skipped.
    /// The first hook to exhaust its attempts fails the phase.
    pub async fn run_phase(
        &self,
        hooks: &[HookSpec],
        phase: HookPhase,
        node: Option<&ResolvedRelease>,
        attempt: u32,
        status: HookStatus,
    ) -> StackResult<()> {
        let node_id = node.map(|n| n.id.as_str()).unwrap_or_default();
        for hook in hooks {
            if !hook
                .effective_when(phase)
                .matches(status == HookStatus::Success)
            {
                self.recorder.emit(
                    node_id,
                    EventType::HookSkipped,
                    attempt,
                    format!("{} {} skipped", phase, hook.display_name()),
                    hook_fields(hook, phase).set("reason", format!("status={}", status.as_str())),
                    None,
                )?;
                continue;
            }
            self.run_hook(hook, phase, node, attempt).await?;
        }
        Ok(())
    }

    async fn run_hook(
        &self,
        hook: &HookSpec,
        phase: HookPhase,
        node: Option<&ResolvedRelease>,
        node_attempt: u32,
    ) -> StackResult<()> {
        let node_id = node.map(|n| n.id.clone()).unwrap_or_default();
        let name = hook.display_name();
        let desc = format!("{} {}", phase, name);
        let max_attempts = self.policy.attempts_for(hook);

        self.recorder.emit(
            &node_id,
            EventType::HookStarted,
            node_attempt,
            desc.clone(),
            hook_fields(hook, phase),
            None,
        )?;

        let output: OutputCallback = {
            let recorder = self.recorder.clone();
            let node_id = node_id.clone();
            let desc = desc.clone();
            Arc::new(move |line: &str| {
                recorder.log(
                    &node_id,
                    node_attempt,
                    format!("hook-output {}: {}", desc, line),
                    Fields::new().set("kind", "hook-output"),
                );
            })
        };
        let ctx = self.context_for(node, output);

        let mut attempt = 1;
        loop {
            tracing::debug!(hook = %desc, node = %node_id, attempt, "running hook");
            let err = match self.runner.run(hook, &ctx).await {
                Ok(()) => {
                    self.recorder.emit(
                        &node_id,
                        EventType::HookSucceeded,
                        node_attempt,
                        desc.clone(),
                        hook_fields(hook, phase).set("attempt", attempt),
                        None,
                    )?;
                    return Ok(());
                }
                Err(err) => err,
            };

            if attempt < max_attempts {
                let backoff = self.policy.backoff(attempt);
                let backoff_str = humantime::format_duration(backoff).to_string();
                tracing::warn!(hook = %desc, node = %node_id, attempt, max_attempts, error = %err, "hook failed, retrying");
                self.recorder.log(
                    &node_id,
                    node_attempt,
                    format!(
                        "hook {} failed (attempt {}/{}): {} (retrying in {})",
                        desc, attempt, max_attempts, err, backoff_str
                    ),
                    Fields::new()
                        .set("hook", name.clone())
                        .set("attempt", attempt)
                        .set("maxAttempts", max_attempts)
                        .set("backoff", backoff_str),
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.cancel.cancelled() => {
                        tracing::warn!(hook = %desc, node = %node_id, attempt, "hook retry abandoned, run cancelled");
                        self.recorder.emit(
                            &node_id,
                            EventType::HookFailed,
                            node_attempt,
                            format!("{}: cancelled after attempt {}/{}: {}", desc, attempt, max_attempts, err),
                            hook_fields(hook, phase).set("attempt", attempt),
                            Some(RunError::from(&StackError::Cancelled)),
                        )?;
                        return Err(StackError::Cancelled);
                    }
                }
                attempt += 1;
                continue;
            }

            let failure = StackError::from_hook(&name, phase.as_str(), &err);
            self.recorder.emit(
                &node_id,
                EventType::HookFailed,
                node_attempt,
                format!("{}: {}", desc, err),
                hook_fields(hook, phase).set("attempt", attempt),
                Some(RunError::new(failure.class(), format!("{}: {}", desc, err))),
            )?;
            return Err(failure);
        }
    }

    /// Report hooks bound to the other command's phases as skipped
    pub fn report_inactive(
        &self,
        hooks: &HooksConfig,
        node_id: &str,
        attempt: u32,
    ) -> StackResult<()> {
        let Some(command) = self.base.command else {
            return Ok(());
        };
        for phase in HookPhase::ALL {
            if phase.command() == command {
                continue;
            }
            for hook in hooks.for_phase(phase) {
                self.recorder.emit(
                    node_id,
                    EventType::HookSkipped,
                    attempt,
                    format!("{} {} skipped", phase, hook.display_name()),
                    hook_fields(hook, phase)
                        .set("reason", format!("phase={} command={}", phase, command.as_str())),
                    None,
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::{script_hook, CaptureObserver, ScriptedHookRunner};
    use std::time::Duration;

    fn engine(runner: Arc<ScriptedHookRunner>, capture: Arc<CaptureObserver>) -> HookEngine {
        engine_with_backoff(runner, capture, Duration::from_millis(1))
    }

    fn engine_with_backoff(
        runner: Arc<ScriptedHookRunner>,
        capture: Arc<CaptureObserver>,
        base_backoff: Duration,
    ) -> HookEngine {
        let recorder = Arc::new(RunRecorder::new("r1", None, vec![capture as Arc<dyn crate::execution::events::RunEventObserver>]));
        let policy = HookRetryPolicy {
            default_attempts: 1,
            base_backoff,
            max_backoff: base_backoff * 5,
        };
        let base = HookContext {
            command: Some(StackCommand::Apply),
            ..Default::default()
        };
        HookEngine::new(runner, policy, recorder, base)
    }

    #[tokio::test]
    async fn test_retry_then_success_accounting() {
        let runner = Arc::new(ScriptedHookRunner::default());
        runner.fail_times("migrate", 1);
        let capture = Arc::new(CaptureObserver::default());
        let engine = engine(runner.clone(), capture.clone());
        let mut hook = script_hook("migrate");
        hook.retry = Some(3);

        engine
            .run_phase(&[hook], HookPhase::PreApply, None, 0, HookStatus::Success)
            .await
            .unwrap();

        let retry_logs: Vec<_> = capture
            .of_type(EventType::NodeLog)
            .into_iter()
            .filter(|e| e.message.contains("failed (attempt"))
            .collect();
        assert_eq!(retry_logs.len(), 1);
        assert!(retry_logs[0]
            .message
            .starts_with("hook pre-apply migrate failed (attempt 1/3)"));
        let ok = capture.of_type(EventType::HookSucceeded);
        assert_eq!(ok.len(), 1);
        assert_eq!(ok[0].fields["attempt"], 2);
        assert!(capture.of_type(EventType::HookFailed).is_empty());
        assert_eq!(runner.calls("migrate"), 2);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_phase() {
        let runner = Arc::new(ScriptedHookRunner::default());
        runner.fail_times("notify", 5);
        let capture = Arc::new(CaptureObserver::default());
        let engine = engine(runner.clone(), capture.clone());
        let mut hook = script_hook("notify");
        hook.retry = Some(2);

        let err = engine
            .run_phase(&[hook], HookPhase::PostApply, None, 0, HookStatus::Success)
            .await
            .unwrap_err();
        assert_eq!(err.class(), "HOOK_FAILED");
        let failed = capture.of_type(EventType::HookFailed);
        assert_eq!(failed.len(), 1);
        let run_err = failed[0].error.as_ref().unwrap();
        assert_eq!(run_err.class, "HOOK_FAILED");
        assert!(run_err.message.starts_with("post-apply notify: "));
        assert_eq!(runner.calls("notify"), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_retries_after_inflight_attempt() {
        let runner = Arc::new(ScriptedHookRunner::default());
        runner.fail_times("migrate", 10);
        let capture = Arc::new(CaptureObserver::default());
        let cancel = CancellationToken::new();
        let engine = engine_with_backoff(runner.clone(), capture.clone(), Duration::from_millis(200))
            .with_cancel(cancel.clone());
        let mut hook = script_hook("migrate");
        hook.retry = Some(5);

        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let started = std::time::Instant::now();
        let err = engine
            .run_phase(&[hook], HookPhase::PreApply, None, 0, HookStatus::Success)
            .await
            .unwrap_err();
        trigger.await.unwrap();

        assert!(matches!(err, StackError::Cancelled));
        assert_eq!(runner.calls("migrate"), 1);
        assert!(started.elapsed() < Duration::from_millis(200));
        let failed = capture.of_type(EventType::HookFailed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_ref().unwrap().class, "CANCELLED");
        assert!(failed[0]
            .message
            .starts_with("pre-apply migrate: cancelled after attempt 1/5"));
    }

    #[tokio::test]
    async fn test_when_filters_post_hooks_on_failure() {
        let runner = Arc::new(ScriptedHookRunner::default());
        let capture = Arc::new(CaptureObserver::default());
        let engine = engine(runner.clone(), capture.clone());
        let on_success = script_hook("announce");
        let mut on_failure = script_hook("page");
        on_failure.when = Some(crate::config::HookWhen::Failure);

        engine
            .run_phase(
                &[on_success, on_failure],
                HookPhase::PostApply,
                None,
                0,
                HookStatus::Failure,
            )
            .await
            .unwrap();

        let skipped = capture.of_type(EventType::HookSkipped);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].message, "post-apply announce skipped");
        assert_eq!(skipped[0].field_str("reason"), Some("status=failure"));
        assert_eq!(runner.calls("page"), 1);
        assert_eq!(runner.calls("announce"), 0);
    }

    #[tokio::test]
    async fn test_other_command_hooks_reported_inactive() {
        let runner = Arc::new(ScriptedHookRunner::default());
        let capture = Arc::new(CaptureObserver::default());
        let engine = engine(runner, capture.clone());
        let hooks = HooksConfig {
            pre_delete: vec![script_hook("drain")],
            pre_apply: vec![script_hook("lint")],
            ..Default::default()
        };
        engine.report_inactive(&hooks, "c/ns/a", 1).unwrap();

        let skipped = capture.of_type(EventType::HookSkipped);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].message, "pre-delete drain skipped");
        assert_eq!(
            skipped[0].field_str("reason"),
            Some("phase=pre-delete command=apply")
        );
    }
}
