// Run Coordinator
// Drives one stack run: scheduling, budgets, retries, stack hooks and the final summary

use super::events::{format_ts, now_ns, EventType, Fields, RunError, RunEventObserver};
use super::hooks::{HookEngine, HookStatus};
use super::node::NodeExecutor;
use super::recorder::RunRecorder;
use super::scheduler::{Blocked, Scheduler, Transition};
use crate::backend::DeployBackend;
use crate::config::{FailMode, HookPhase, HookRetryPolicy, RunnerSettings, StackCommand};
use crate::error::{StackError, StackResult};
use crate::runners::{HookContext, HookRunner};
use crate::stack::{Plan, ResolvedRelease, RunSelector};
use crate::state::{
    NewRun, NodeStatus, OperatorMeta, RunPlan, RunStatus, RunSummary, StateStore, StoreError,
};

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Ceiling for the delay between node attempts
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Everything a single run needs besides the plan
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub command: StackCommand,
    /// Generated from the current time when empty
    pub run_id: String,
    pub concurrency: usize,
    pub fail_mode: FailMode,
    pub progressive_concurrency: bool,
    /// 0 = unlimited
    pub max_parallel_per_namespace: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub hook_retry: HookRetryPolicy,
    /// Attempts already spent per node, carried over by resume
    pub initial_attempts: BTreeMap<String, u32>,
    pub kubeconfig: String,
    pub kube_context: String,
    pub selector: RunSelector,
    pub cancel: CancellationToken,
    pub operator: Option<OperatorMeta>,
}

impl RunOptions {
    pub fn new(command: StackCommand) -> Self {
        Self::from_settings(command, &RunnerSettings::default())
    }

    pub fn from_settings(command: StackCommand, settings: &RunnerSettings) -> Self {
        Self {
            command,
            run_id: String::new(),
            concurrency: settings.concurrency.max(1),
            fail_mode: settings.fail_mode,
            progressive_concurrency: settings.progressive_concurrency,
            max_parallel_per_namespace: settings.max_parallel_per_namespace,
            max_attempts: settings.max_attempts.max(1),
            retry_backoff: Duration::from_secs(1),
            hook_retry: settings.hook_retry,
            initial_attempts: BTreeMap::new(),
            kubeconfig: String::new(),
            kube_context: String::new(),
            selector: RunSelector::default(),
            cancel: CancellationToken::new(),
            operator: None,
        }
    }
}

/// Final state of a run that reached RUN_COMPLETED
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub summary: RunSummary,
    /// Empty when the run was not persisted
    pub run_digest: String,
    /// First node or hook error, for the CLI result line
    pub first_error: Option<String>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// UTC timestamp id, sortable and safe in file names
pub fn new_run_id() -> String {
    Utc::now().format("%Y-%m-%dT%H-%M-%S%.9fZ").to_string()
}

/// Linear backoff between node attempts
pub fn retry_backoff(base: Duration, failed_attempts: u32) -> Duration {
    base.saturating_mul(failed_attempts.max(1)).min(MAX_RETRY_BACKOFF)
}

/// Adaptive worker limit for progressive runs
///
/// Starts at one worker, grows by one per success and shrinks on failures.
#[derive(Debug)]
struct Throttle {
    limit: usize,
    current: usize,
    progressive: bool,
    consecutive_failures: u32,
}

impl Throttle {
    fn new(limit: usize, progressive: bool) -> Self {
        let progressive = progressive && limit > 1;
        Self {
            limit,
            current: if progressive { 1 } else { limit },
            progressive,
            consecutive_failures: 0,
        }
    }

    fn current(&self) -> usize {
        self.current
    }

    fn on_success(&mut self) -> Option<(usize, usize, &'static str)> {
        self.consecutive_failures = 0;
        self.adjust((self.current + 1).min(self.limit), "success")
    }

    fn on_failure(&mut self) -> Option<(usize, usize, &'static str)> {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= 2 {
            return self.adjust(1, "repeated-failure");
        }
        self.adjust((self.current / 2).max(1), "failure")
    }

    fn adjust(&mut self, to: usize, reason: &'static str) -> Option<(usize, usize, &'static str)> {
        if !self.progressive || to == self.current {
            return None;
        }
        let from = self.current;
        self.current = to;
        Some((from, to, reason))
    }
}

struct NodeOutcome {
    id: String,
    attempt: u32,
    result: StackResult<()>,
}

/// Retry loop for one node, run on its own task
struct Worker {
    executor: NodeExecutor,
    recorder: Arc<RunRecorder>,
    cancel: CancellationToken,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl Worker {
    async fn drive(&self, node: ResolvedRelease, prior_attempts: u32) -> NodeOutcome {
        let mut attempt = prior_attempts;
        let mut tries = 0;
        let result = loop {
            attempt += 1;
            tries += 1;
            if tries == 1 {
                if let Err(e) = self
                    .executor
                    .hooks()
                    .report_inactive(&node.hooks, &node.id, attempt)
                {
                    break Err(e);
                }
            }
            if let Err(e) = self.recorder.emit(
                &node.id,
                EventType::NodeRunning,
                attempt,
                "",
                Fields::new(),
                None,
            ) {
                break Err(e);
            }

            let failure = match self.executor.run(&node, attempt).await {
                Ok(()) => {
                    break self
                        .recorder
                        .emit(&node.id, EventType::NodeSucceeded, attempt, "", Fields::new(), None)
                        .map(|_| ());
                }
                Err(failure) => failure,
            };

            let run_err = RunError::from(&failure.error);
            if let Err(e) = self.recorder.emit(
                &node.id,
                EventType::NodeFailed,
                attempt,
                failure.error.to_string(),
                Fields::new().set("retryable", failure.retryable),
                Some(run_err.clone()),
            ) {
                break Err(e);
            }

            let terminal = failure.error.is_fatal()
                || matches!(failure.error, StackError::Cancelled)
                || self.cancel.is_cancelled();
            if terminal || !failure.retryable || tries >= self.max_attempts {
                break Err(failure.error);
            }

            let backoff = retry_backoff(self.retry_backoff, tries);
            let backoff_str = humantime::format_duration(backoff).to_string();
            tracing::warn!(node = %node.id, attempt, error = %failure.error, backoff = %backoff_str, "node failed, retrying");
            if let Err(e) = self.recorder.emit(
                &node.id,
                EventType::RetryScheduled,
                attempt + 1,
                format!("retrying in {}", backoff_str),
                Fields::new().set("backoff", backoff_str),
                Some(run_err),
            ) {
                break Err(e);
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.cancel.cancelled() => break Err(StackError::Cancelled),
            }
        };
        NodeOutcome {
            id: node.id,
            attempt,
            result,
        }
    }
}

/// Mutable bookkeeping of one run, owned by the coordinator loop
struct RunState<'a> {
    plan: &'a Plan,
    opts: &'a RunOptions,
    store: Option<Arc<StateStore>>,
    recorder: Arc<RunRecorder>,
    scheduler: Scheduler,
    throttle: Throttle,
    attempts: BTreeMap<String, u32>,
    blocked_reasons: BTreeMap<String, String>,
    running_per_namespace: BTreeMap<String, usize>,
    budget_reported: BTreeSet<String>,
    started_at: String,
    fatal: Option<StackError>,
    first_error: Option<String>,
    cancelled: bool,
}

impl RunState<'_> {
    /// Record a durable event; the first store failure becomes the run's fatal error
    fn emit(
        &mut self,
        node_id: &str,
        event_type: EventType,
        attempt: u32,
        message: impl Into<String>,
        fields: Fields,
    ) {
        if self.recorder.is_fatal() {
            return;
        }
        if let Err(err) = self
            .recorder
            .emit(node_id, event_type, attempt, message, fields, None)
        {
            self.fail_fatal(err);
        }
    }

    fn fail_fatal(&mut self, err: StackError) {
        if self.fatal.is_some() {
            return;
        }
        tracing::error!(run_id = %self.recorder.run_id(), error = %err, "run aborted");
        self.first_error.get_or_insert_with(|| err.to_string());
        self.fatal = Some(err);
        let blocked = self.scheduler.block_remaining("run aborted");
        self.report_blocked(blocked);
    }

    fn apply_transition(&mut self, t: Transition) {
        for id in t.queued {
            let attempt = self.attempts.get(&id).copied().unwrap_or(0);
            self.emit(&id, EventType::NodeQueued, attempt, "", Fields::new());
        }
        self.report_blocked(t.blocked);
    }

    fn report_blocked(&mut self, blocked: Vec<Blocked>) {
        for b in blocked {
            let attempt = self.attempts.get(&b.node_id).copied().unwrap_or(0);
            self.emit(
                &b.node_id,
                EventType::NodeBlocked,
                attempt,
                b.reason.clone(),
                Fields::new().set("reason", b.reason.clone()),
            );
            self.blocked_reasons.insert(b.node_id, b.reason);
        }
    }

    fn set_concurrency(&mut self, change: Option<(usize, usize, &'static str)>) {
        if let Some((from, to, reason)) = change {
            tracing::info!(from, to, reason, "concurrency adjusted");
            self.emit(
                "",
                EventType::RunConcurrency,
                0,
                format!("concurrency {} -> {}", from, to),
                Fields::new()
                    .set("from", from)
                    .set("to", to)
                    .set("reason", reason),
            );
        }
    }

    /// Ready nodes that fit the worker and namespace budgets, in ID order
    fn admit(&mut self) -> Vec<String> {
        let plan = self.plan;
        let mut admitted = Vec::new();
        let ready: Vec<String> = self.scheduler.ready().cloned().collect();
        for id in ready {
            if self.scheduler.running() >= self.throttle.current() {
                break;
            }
            let Some(node) = plan.node(&id) else {
                continue;
            };
            let limit = self.opts.max_parallel_per_namespace;
            let used = self
                .running_per_namespace
                .get(&node.namespace)
                .copied()
                .unwrap_or(0);
            if limit > 0 && used >= limit {
                if self.budget_reported.insert(id.clone()) {
                    let namespace = node.namespace.clone();
                    let attempt = self.attempts.get(&id).copied().unwrap_or(0);
                    self.emit(
                        &id,
                        EventType::BudgetWait,
                        attempt,
                        format!("waiting for namespace {} budget", namespace),
                        Fields::new()
                            .set("budgetType", "namespace")
                            .set("budgetKey", namespace)
                            .set("limit", limit)
                            .set("used", used),
                    );
                }
                continue;
            }
            if !self.scheduler.start(&id) {
                continue;
            }
            *self
                .running_per_namespace
                .entry(node.namespace.clone())
                .or_default() += 1;
            admitted.push(id);
        }
        admitted
    }

    fn finish_node(&mut self, outcome: NodeOutcome) {
        self.attempts.insert(outcome.id.clone(), outcome.attempt);
        let plan = self.plan;
        if let Some(node) = plan.node(&outcome.id) {
            if let Some(n) = self.running_per_namespace.get_mut(&node.namespace) {
                *n = n.saturating_sub(1);
            }
        }
        match outcome.result {
            Ok(()) => {
                let t = self.scheduler.mark_succeeded(&outcome.id);
                let change = self.throttle.on_success();
                self.set_concurrency(change);
                self.apply_transition(t);
            }
            Err(err) => {
                tracing::warn!(node = %outcome.id, attempt = outcome.attempt, error = %err, "node failed");
                if self.first_error.is_none() {
                    self.first_error = Some(err.to_string());
                }
                let t = self.scheduler.mark_failed(&outcome.id, err.to_string());
                if err.is_fatal() {
                    self.fail_fatal(err);
                    return;
                }
                let change = self.throttle.on_failure();
                self.set_concurrency(change);
                self.apply_transition(t);
            }
        }
        self.persist_summary(RunStatus::Running);
    }

    fn summary(&self, status: RunStatus) -> RunSummary {
        let mut summary = RunSummary::planned(
            self.recorder.run_id(),
            self.scheduler.order().to_vec(),
            self.started_at.clone(),
        );
        for (id, node) in summary.nodes.iter_mut() {
            node.status = self.scheduler.status(id).unwrap_or(NodeStatus::Planned);
            node.attempt = self.attempts.get(id).copied().unwrap_or(0);
            node.error = match node.status {
                NodeStatus::Failed => self.scheduler.error(id).unwrap_or_default().to_string(),
                NodeStatus::Blocked => self.blocked_reasons.get(id).cloned().unwrap_or_default(),
                _ => String::new(),
            };
        }
        summary.status = status;
        summary.updated_at = format_ts(now_ns());
        summary.recount();
        summary
    }

    fn persist_summary(&mut self, status: RunStatus) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if self.fatal.is_some() {
            return;
        }
        let summary = self.summary(status);
        if let Err(err) = store.write_summary(self.recorder.run_id(), &summary) {
            self.fail_fatal(err.into());
        }
    }
}

fn single_namespace(plan: &Plan) -> String {
    let namespaces: BTreeSet<&str> = plan
        .nodes
        .iter()
        .map(|n| n.namespace.as_str())
        .filter(|ns| !ns.is_empty())
        .collect();
    match namespaces.len() {
        1 => namespaces.into_iter().next().unwrap_or_default().to_string(),
        _ => String::new(),
    }
}

/// Executes plans against a deploy backend
pub struct Coordinator {
    backend: Arc<dyn DeployBackend>,
    hook_runner: Arc<dyn HookRunner>,
    store: Option<Arc<StateStore>>,
    observers: Vec<Arc<dyn RunEventObserver>>,
}

impl Coordinator {
    pub fn new(backend: Arc<dyn DeployBackend>, hook_runner: Arc<dyn HookRunner>) -> Self {
        Self {
            backend,
            hook_runner,
            store: None,
            observers: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunEventObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Run `plan` to completion
    ///
    /// Node failures end in a FAILED outcome, not an error. `Err` is reserved
    /// for problems that leave the run unrecordable: an invalid plan, a store
    /// failure or a scheduler deadlock.
    pub async fn run(&self, plan: &Plan, opts: RunOptions) -> StackResult<RunOutcome> {
        if opts.concurrency == 0 {
            return Err(StackError::Validation("concurrency must be at least 1".into()));
        }
        let command = opts.command;
        let run_id = match opts.run_id.trim() {
            "" => new_run_id(),
            id => id.to_string(),
        };
        let started_ns = now_ns();

        let run_plan = RunPlan::build(
            &run_id,
            plan,
            command,
            opts.concurrency,
            opts.fail_mode,
            &opts.selector,
        )
        .map_err(StoreError::from)?;
        if let Some(store) = &self.store {
            let operator = opts
                .operator
                .clone()
                .unwrap_or_else(|| OperatorMeta::detect(&plan.stack_root));
            store.create_run(&NewRun {
                plan: &run_plan,
                operator: &operator,
                kubeconfig: &opts.kubeconfig,
                kube_context: &opts.kube_context,
                created_at_ns: started_ns,
            })?;
        }

        let recorder = Arc::new(RunRecorder::new(
            run_id.clone(),
            self.store.clone(),
            self.observers.clone(),
        ));
        let base = HookContext {
            stack_root: plan.stack_root.clone(),
            profile: plan.profile.clone(),
            run_id: run_id.clone(),
            command: Some(command),
            kubeconfig: opts.kubeconfig.clone(),
            kube_context: opts.kube_context.clone(),
            inferred_namespace: single_namespace(plan),
            ..Default::default()
        };
        let hooks = Arc::new(
            HookEngine::new(self.hook_runner.clone(), opts.hook_retry, recorder.clone(), base)
                .with_cancel(opts.cancel.clone()),
        );
        let worker = Arc::new(Worker {
            executor: NodeExecutor::new(
                recorder.clone(),
                hooks.clone(),
                self.backend.clone(),
                command,
                opts.kubeconfig.clone(),
                opts.kube_context.clone(),
                opts.cancel.clone(),
            ),
            recorder: recorder.clone(),
            cancel: opts.cancel.clone(),
            max_attempts: opts.max_attempts.max(1),
            retry_backoff: opts.retry_backoff,
        });

        let mut state = RunState {
            plan,
            opts: &opts,
            store: self.store.clone(),
            recorder: recorder.clone(),
            scheduler: Scheduler::new(&plan.nodes, command, opts.fail_mode),
            throttle: Throttle::new(opts.concurrency, opts.progressive_concurrency),
            attempts: opts.initial_attempts.clone(),
            blocked_reasons: BTreeMap::new(),
            running_per_namespace: BTreeMap::new(),
            budget_reported: BTreeSet::new(),
            started_at: format_ts(started_ns),
            fatal: None,
            first_error: None,
            cancelled: false,
        };

        tracing::info!(run_id = %run_id, command = command.as_str(), nodes = plan.nodes.len(), concurrency = opts.concurrency, "stack run started");
        state.emit(
            "",
            EventType::RunStarted,
            0,
            format!("{} {} releases", command.as_str(), plan.nodes.len()),
            Fields::new()
                .set("command", command.as_str())
                .set("stackName", plan.stack_name.clone())
                .set("profile", plan.profile.clone())
                .set("nodes", plan.nodes.len())
                .set("concurrency", opts.concurrency)
                .set("failMode", opts.fail_mode.as_str())
                .set("progressive", opts.progressive_concurrency)
                .set("planHash", run_plan.plan_hash.clone()),
        );
        for node in &plan.nodes {
            let attempt = state.attempts.get(&node.id).copied().unwrap_or(0);
            state.emit(
                &node.id,
                EventType::NodeMeta,
                attempt,
                "",
                Fields::new()
                    .set("cluster", node.cluster.name.clone())
                    .set("namespace", node.namespace.clone())
                    .set("name", node.name.clone())
                    .set("executionGroup", node.execution_group)
                    .set("parallelismGroup", node.parallelism_group.clone())
                    .set("critical", node.critical),
            );
        }
        if state.throttle.progressive {
            let from = opts.concurrency;
            state.set_concurrency(Some((from, 1, "progressive-start")));
        }

        let pre = HookPhase::for_command(command, true);
        let post = HookPhase::for_command(command, false);
        let mut stack_hooks_ok = true;
        if state.fatal.is_none() {
            if let Err(err) = hooks.report_inactive(&plan.stack_hooks, "", 0) {
                state.fail_fatal(err);
            }
        }
        if state.fatal.is_none() {
            let pre_hooks = plan.stack_hooks.for_phase(pre);
            if let Err(err) = hooks
                .run_phase(pre_hooks, pre, None, 0, HookStatus::Success)
                .await
            {
                if err.is_fatal() {
                    state.fail_fatal(err);
                } else if matches!(err, StackError::Cancelled) {
                    // the scheduling loop blocks every node as cancelled
                    stack_hooks_ok = false;
                } else {
                    tracing::error!(run_id = %run_id, error = %err, "stack hooks failed");
                    stack_hooks_ok = false;
                    state.first_error = Some(err.to_string());
                    let blocked = state
                        .scheduler
                        .block_remaining(&format!("stack {} hooks failed", pre));
                    state.report_blocked(blocked);
                }
            }
        }

        if state.fatal.is_none() && stack_hooks_ok {
            let seeded = state.scheduler.seed();
            state.apply_transition(Transition {
                queued: seeded,
                blocked: Vec::new(),
            });
            state.persist_summary(RunStatus::Running);
        }

        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();
        loop {
            if !state.cancelled && opts.cancel.is_cancelled() {
                tracing::warn!(run_id = %run_id, "run cancelled");
                state.cancelled = true;
                let blocked = state.scheduler.block_remaining("cancelled");
                state.report_blocked(blocked);
            }
            if state.fatal.is_none() && !state.cancelled {
                for id in state.admit() {
                    let Some(node) = plan.node(&id).cloned() else {
                        continue;
                    };
                    let prior = state.attempts.get(&id).copied().unwrap_or(0);
                    let worker = worker.clone();
                    let span = tracing::info_span!("node", id = %id, attempt = prior + 1);
                    tasks.spawn(async move { worker.drive(node, prior).await }.instrument(span));
                }
            }

            if tasks.is_empty() {
                if state.scheduler.all_terminal() || state.fatal.is_some() || state.cancelled {
                    break;
                }
                let pending = state.scheduler.deadlocked().unwrap_or_default();
                state.fail_fatal(StackError::SchedulerDeadlock { pending });
                break;
            }

            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = opts.cancel.cancelled(), if !state.cancelled => continue,
            };
            match joined {
                Some(Ok(outcome)) => state.finish_node(outcome),
                Some(Err(join_err)) => {
                    state.fail_fatal(StackError::Validation(format!("node worker failed: {}", join_err)))
                }
                None => {}
            }
        }

        // workers lost to a panic never reported back
        let stranded: Vec<String> = state
            .scheduler
            .order()
            .iter()
            .filter(|id| state.scheduler.status(id) == Some(NodeStatus::Running))
            .cloned()
            .collect();
        for id in stranded {
            state.scheduler.mark_failed(&id, "worker lost");
        }

        let nodes_ok = state.scheduler.all_succeeded();
        if state.fatal.is_none() && stack_hooks_ok && !state.cancelled {
            let post_hooks = plan.stack_hooks.for_phase(post);
            if let Err(err) = hooks
                .run_phase(post_hooks, post, None, 0, HookStatus::from_ok(nodes_ok))
                .await
            {
                if err.is_fatal() {
                    state.fail_fatal(err);
                } else {
                    tracing::error!(run_id = %run_id, error = %err, "stack hooks failed");
                    stack_hooks_ok = false;
                    state.first_error.get_or_insert(err.to_string());
                }
            }
        }

        let status = if state.cancelled {
            RunStatus::Cancelled
        } else if nodes_ok && stack_hooks_ok && state.fatal.is_none() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        let summary = state.summary(status);
        state.emit(
            "",
            EventType::RunCompleted,
            0,
            status.as_str(),
            Fields::new()
                .set("status", status.as_str())
                .set("planned", summary.totals.planned)
                .set("succeeded", summary.totals.succeeded)
                .set("failed", summary.totals.failed)
                .set("blocked", summary.totals.blocked),
        );
        tracing::info!(
            run_id = %run_id,
            status = status.as_str(),
            succeeded = summary.totals.succeeded,
            failed = summary.totals.failed,
            blocked = summary.totals.blocked,
            "stack run completed"
        );

        let mut run_digest = String::new();
        if let Some(store) = &self.store {
            // the summary must land even when the event log has failed
            let written = store.write_summary(&run_id, &summary);
            if let Some(err) = state.fatal {
                if let Err(write_err) = written {
                    tracing::error!(run_id = %run_id, error = %write_err, "failed to write summary of aborted run");
                }
                return Err(err);
            }
            written?;
            if !recorder.is_fatal() {
                run_digest = store.finalize_run(&run_id, now_ns())?;
            }
        }
        if let Some(err) = state.fatal {
            return Err(err);
        }

        Ok(RunOutcome {
            run_id,
            status,
            summary,
            run_digest,
            first_error: state.first_error,
        })
    }
}
