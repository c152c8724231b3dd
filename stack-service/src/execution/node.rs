// Node Executor
// Phase sequence for one release: pre hooks, apply or delete, post hooks

use super::events::{EventType, Fields};
use super::hooks::{HookEngine, HookStatus};
use super::recorder::RunRecorder;
use crate::backend::{BackendError, DeployBackend, ReleaseRequest};
use crate::config::{HookPhase, StackCommand};
use crate::error::{StackError, StackResult};
use crate::runners::OutputCallback;
use crate::stack::ResolvedRelease;
use crate::state::{check_apply_cache, ApplyCacheDecision, ApplyCacheKey};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Backend output lines kept as durable events per call
pub const HELM_LOG_LIMIT: usize = 50;

/// A failed attempt and whether the coordinator may retry it
#[derive(Debug)]
pub struct NodeFailure {
    pub error: StackError,
    pub retryable: bool,
}

impl From<StackError> for NodeFailure {
    fn from(error: StackError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

pub struct NodeExecutor {
    recorder: Arc<RunRecorder>,
    hooks: Arc<HookEngine>,
    backend: Arc<dyn DeployBackend>,
    command: StackCommand,
    kubeconfig: String,
    kube_context: String,
    cancel: CancellationToken,
}

fn phase_fields(phase: &str, status: Option<&str>) -> Fields {
    let fields = Fields::new().set("phase", phase);
    match status {
        Some(s) => fields.set("status", s),
        None => fields,
    }
}

impl NodeExecutor {
    pub fn new(
        recorder: Arc<RunRecorder>,
        hooks: Arc<HookEngine>,
        backend: Arc<dyn DeployBackend>,
        command: StackCommand,
        kubeconfig: impl Into<String>,
        kube_context: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            recorder,
            hooks,
            backend,
            command,
            kubeconfig: kubeconfig.into(),
            kube_context: kube_context.into(),
            cancel,
        }
    }

    pub fn hooks(&self) -> &HookEngine {
        &self.hooks
    }

    fn check_cancelled(&self) -> Result<(), NodeFailure> {
        if self.cancel.is_cancelled() {
            return Err(StackError::Cancelled.into());
        }
        Ok(())
    }

    /// One attempt of the full phase sequence
    pub async fn run(&self, node: &ResolvedRelease, attempt: u32) -> Result<(), NodeFailure> {
        let pre = HookPhase::for_command(self.command, true);
        let post = HookPhase::for_command(self.command, false);

        self.hook_phase(node, pre, attempt, HookStatus::Success).await?;
        self.check_cancelled()?;

        let resource = self.resource_phase(node, attempt).await;
        if let Err(failure) = resource {
            if failure.error.is_fatal() || matches!(failure.error, StackError::Cancelled) {
                return Err(failure);
            }
            // failure/always hooks still observe the failed phase
            if let Err(hook_err) = self
                .hook_phase(node, post, attempt, HookStatus::Failure)
                .await
            {
                if hook_err.error.is_fatal() {
                    return Err(hook_err);
                }
            }
            return Err(failure);
        }
        // a release with nothing left to run keeps its completed phase
        if !node.hooks.for_phase(post).is_empty() {
            self.check_cancelled()?;
        }

        self.hook_phase(node, post, attempt, HookStatus::Success).await
    }

    async fn hook_phase(
        &self,
        node: &ResolvedRelease,
        phase: HookPhase,
        attempt: u32,
        status: HookStatus,
    ) -> Result<(), NodeFailure> {
        let hooks = node.hooks.for_phase(phase);
        if hooks.is_empty() {
            return Ok(());
        }
        self.recorder.emit(
            &node.id,
            EventType::PhaseStarted,
            attempt,
            "",
            phase_fields(phase.as_str(), None),
            None,
        )?;
        let result = self
            .hooks
            .run_phase(hooks, phase, Some(node), attempt, status)
            .await;
        let (phase_status, message) = match &result {
            Ok(()) => ("succeeded", String::new()),
            Err(e) => ("failed", e.to_string()),
        };
        self.recorder.emit(
            &node.id,
            EventType::PhaseCompleted,
            attempt,
            message,
            phase_fields(phase.as_str(), Some(phase_status)),
            None,
        )?;
        result.map_err(NodeFailure::from)
    }

    fn helm_log_sink(&self, node: &ResolvedRelease, attempt: u32) -> OutputCallback {
        let recorder = self.recorder.clone();
        let node_id = node.id.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        Arc::new(move |line: &str| {
            if seen.fetch_add(1, Ordering::SeqCst) >= HELM_LOG_LIMIT {
                return;
            }
            let _ = recorder.emit(
                &node_id,
                EventType::HelmLog,
                attempt,
                line,
                Fields::new().set("source", "helm"),
                None,
            );
        })
    }

    /// Consult the apply cache; only `apply` runs are ever skipped
    async fn cache_decision(
        &self,
        node: &ResolvedRelease,
        req: &ReleaseRequest<'_>,
    ) -> StackResult<Option<ApplyCacheDecision>> {
        if self.command != StackCommand::Apply {
            return Ok(None);
        }
        let has_hooks = node.has_hooks_for(self.command);
        let key = ApplyCacheKey::for_node(node, self.command);
        let store = self.recorder.store().map(|s| s.as_ref());
        let observed = if store.is_some() && !has_hooks {
            match self.backend.observed_digest(req).await {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(node = %node.id, error = %err, "observed digest unavailable");
                    None
                }
            }
        } else {
            None
        };
        let decision = check_apply_cache(
            store,
            &key,
            &node.effective_input_hash,
            has_hooks,
            observed.as_deref(),
        )?;
        tracing::debug!(node = %node.id, reason = %decision.reason, skip = decision.skip, "apply cache checked");
        Ok(Some(decision))
    }

    async fn resource_phase(&self, node: &ResolvedRelease, attempt: u32) -> Result<(), NodeFailure> {
        let phase = self.command.as_str();
        self.recorder.emit(
            &node.id,
            EventType::PhaseStarted,
            attempt,
            "",
            phase_fields(phase, None),
            None,
        )?;

        let req = ReleaseRequest {
            node,
            kubeconfig: &self.kubeconfig,
            kube_context: &self.kube_context,
            on_log: Some(self.helm_log_sink(node, attempt)),
        };

        let decision = self.cache_decision(node, &req).await?;
        let cache_fields = |fields: Fields| match &decision {
            Some(d) => fields
                .set("cacheReason", d.reason.as_str())
                .set("cacheHit", d.cache_hit),
            None => fields,
        };
        if let Some(d) = decision.as_ref().filter(|d| d.skip) {
            self.recorder.emit(
                &node.id,
                EventType::PhaseCompleted,
                attempt,
                format!("no-op ({})", d.reason),
                cache_fields(phase_fields(phase, Some("skipped"))),
                None,
            )?;
            return Ok(());
        }

        let result: Result<Option<String>, BackendError> = match self.command {
            StackCommand::Apply => self
                .backend
                .apply(&req)
                .await
                .map(|outcome| outcome.observed_digest),
            StackCommand::Delete => self.backend.delete(&req).await.map(|()| None),
        };

        match result {
            Ok(observed) => {
                self.update_cache(node, observed.as_deref())?;
                self.recorder.emit(
                    &node.id,
                    EventType::PhaseCompleted,
                    attempt,
                    "",
                    cache_fields(phase_fields(phase, Some("succeeded"))),
                    None,
                )?;
                Ok(())
            }
            Err(err) => {
                let error = StackError::from_backend(&node.id, phase, &err);
                self.recorder.emit(
                    &node.id,
                    EventType::PhaseCompleted,
                    attempt,
                    error.to_string(),
                    cache_fields(phase_fields(phase, Some("failed"))),
                    None,
                )?;
                Err(NodeFailure {
                    error,
                    retryable: err.transient,
                })
            }
        }
    }

    fn update_cache(&self, node: &ResolvedRelease, observed: Option<&str>) -> StackResult<()> {
        let Some(store) = self.recorder.store() else {
            return Ok(());
        };
        match self.command {
            StackCommand::Apply => {
                if node.effective_input_hash.trim().is_empty() {
                    return Ok(());
                }
                store.upsert_apply_cache(
                    &ApplyCacheKey::for_node(node, self.command),
                    &node.effective_input_hash,
                    observed.unwrap_or_default(),
                    node.has_hooks_for(self.command),
                    self.recorder.run_id(),
                )?;
            }
            StackCommand::Delete => {
                let key = ApplyCacheKey::for_node(node, StackCommand::Apply);
                store.delete_apply_cache(&key.namespace, &key.release_name)?;
            }
        }
        Ok(())
    }
}
