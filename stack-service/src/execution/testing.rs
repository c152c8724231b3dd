// In-memory fakes for exercising the engine without a cluster

use super::events::{EventType, RunEvent, RunEventObserver};
use crate::backend::{ApplyOutcome, BackendError, DeployBackend, ReleaseRequest};
use crate::config::{HookSpec, HookType, ScriptHookConfig};
use crate::runners::{HookContext, HookRunError, HookRunner};
use crate::stack::ResolvedRelease;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct CaptureObserver {
    events: Mutex<Vec<RunEvent>>,
}

impl CaptureObserver {
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_type(&self, t: EventType) -> Vec<RunEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == t)
            .collect()
    }

    pub fn types_for(&self, node_id: &str) -> Vec<EventType> {
        self.events()
            .into_iter()
            .filter(|e| e.node_id == node_id && !e.event_type.is_ephemeral())
            .map(|e| e.event_type)
            .collect()
    }
}

impl RunEventObserver for CaptureObserver {
    fn observe_run_event(&self, event: &RunEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn script_hook(name: &str) -> HookSpec {
    HookSpec {
        name: name.to_string(),
        hook_type: Some(HookType::Script),
        script: Some(ScriptHookConfig {
            command: vec!["true".to_string()],
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn release(cluster: &str, namespace: &str, name: &str, needs: &[&str]) -> ResolvedRelease {
    ResolvedRelease {
        id: ResolvedRelease::node_id(cluster, namespace, name),
        name: name.to_string(),
        chart: format!("./charts/{}", name),
        namespace: namespace.to_string(),
        cluster: crate::config::ClusterTarget {
            name: cluster.to_string(),
            ..Default::default()
        },
        needs: needs.iter().map(|s| s.to_string()).collect(),
        effective_input_hash: format!("sha256:{}", name),
        ..Default::default()
    }
}

/// Hook runner that fails named hooks a set number of times
#[derive(Default)]
pub struct ScriptedHookRunner {
    failures: Mutex<BTreeMap<String, usize>>,
    calls: Mutex<BTreeMap<String, usize>>,
}

impl ScriptedHookRunner {
    pub fn fail_times(&self, hook: &str, times: usize) {
        self.failures.lock().unwrap().insert(hook.to_string(), times);
    }

    pub fn calls(&self, hook: &str) -> usize {
        self.calls.lock().unwrap().get(hook).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl HookRunner for ScriptedHookRunner {
    async fn run(&self, hook: &HookSpec, ctx: &HookContext) -> Result<(), HookRunError> {
        let name = hook.display_name();
        *self.calls.lock().unwrap().entry(name.clone()).or_default() += 1;
        ctx.emit_output(&format!("running {}", name));
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(HookRunError::Failed(format!("{} exploded", name)))
            }
            _ => Ok(()),
        }
    }
}

/// Backend that records calls and tracks how many run at once
#[derive(Default)]
pub struct FakeBackend {
    pub delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// node id -> (remaining failures, transient)
    failures: Mutex<BTreeMap<String, (usize, bool)>>,
    /// Permanent failure text used for every node instead of a per-node one
    shared_message: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn fail(&self, node_id: &str, times: usize, transient: bool) {
        self.failures
            .lock()
            .unwrap()
            .insert(node_id.to_string(), (times, transient));
    }

    /// Fail every listed node once with the same backend message
    pub fn fail_all_with(&self, node_ids: &[&str], message: &str) {
        for id in node_ids {
            self.fail(id, 1, false);
        }
        *self.shared_message.lock().unwrap() = Some(message.to_string());
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    async fn call(&self, node: &ResolvedRelease) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(node.id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&node.id) {
                Some((left, transient)) if *left > 0 => {
                    *left -= 1;
                    Some(*transient)
                }
                _ => None,
            }
        };
        match failure {
            Some(true) => Err(BackendError::transient("connection refused")),
            Some(false) => {
                let message = self
                    .shared_message
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| format!("{} is broken", node.name));
                Err(BackendError::permanent(message))
            }
            None => {
                self.completed.lock().unwrap().push(node.id.clone());
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl DeployBackend for FakeBackend {
    async fn apply(&self, req: &ReleaseRequest<'_>) -> Result<ApplyOutcome, BackendError> {
        if let Some(log) = &req.on_log {
            log("Release \"x\" has been upgraded");
        }
        self.call(req.node).await?;
        Ok(ApplyOutcome::default())
    }

    async fn delete(&self, req: &ReleaseRequest<'_>) -> Result<(), BackendError> {
        self.call(req.node).await
    }
}
