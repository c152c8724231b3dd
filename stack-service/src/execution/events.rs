// Run Events
// Event log records, error payloads and observer plumbing for stack runs

use crate::error::{error_digest, StackError};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Version tag carried in every event's field map
pub const EVENT_FIELDS_VERSION: i64 = 1;

/// Fixed set of event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunConcurrency,
    NodeMeta,
    NodeQueued,
    NodeRunning,
    NodeSucceeded,
    NodeFailed,
    NodeBlocked,
    PhaseStarted,
    PhaseCompleted,
    HookStarted,
    HookSucceeded,
    HookFailed,
    HookSkipped,
    BudgetWait,
    RetryScheduled,
    /// Not persisted
    NodeLog,
    HelmLog,
}

impl EventType {
    pub const ALL: [EventType; 19] = [
        EventType::RunStarted,
        EventType::RunCompleted,
        EventType::RunConcurrency,
        EventType::NodeMeta,
        EventType::NodeQueued,
        EventType::NodeRunning,
        EventType::NodeSucceeded,
        EventType::NodeFailed,
        EventType::NodeBlocked,
        EventType::PhaseStarted,
        EventType::PhaseCompleted,
        EventType::HookStarted,
        EventType::HookSucceeded,
        EventType::HookFailed,
        EventType::HookSkipped,
        EventType::BudgetWait,
        EventType::RetryScheduled,
        EventType::NodeLog,
        EventType::HelmLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "RUN_STARTED",
            EventType::RunCompleted => "RUN_COMPLETED",
            EventType::RunConcurrency => "RUN_CONCURRENCY",
            EventType::NodeMeta => "NODE_META",
            EventType::NodeQueued => "NODE_QUEUED",
            EventType::NodeRunning => "NODE_RUNNING",
            EventType::NodeSucceeded => "NODE_SUCCEEDED",
            EventType::NodeFailed => "NODE_FAILED",
            EventType::NodeBlocked => "NODE_BLOCKED",
            EventType::PhaseStarted => "PHASE_STARTED",
            EventType::PhaseCompleted => "PHASE_COMPLETED",
            EventType::HookStarted => "HOOK_STARTED",
            EventType::HookSucceeded => "HOOK_SUCCEEDED",
            EventType::HookFailed => "HOOK_FAILED",
            EventType::HookSkipped => "HOOK_SKIPPED",
            EventType::BudgetWait => "BUDGET_WAIT",
            EventType::RetryScheduled => "RETRY_SCHEDULED",
            EventType::NodeLog => "NODE_LOG",
            EventType::HelmLog => "HELM_LOG",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Ephemeral events reach observers but never the event log
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, EventType::NodeLog)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure attached to an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub class: String,
    pub message: String,
    pub digest: String,
}

impl RunError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        let class = class.into();
        let message = message.into();
        let digest = error_digest(&class, &message);
        Self {
            class,
            message,
            digest,
        }
    }
}

impl From<&StackError> for RunError {
    /// Keeps the full message but digests only the root cause
    fn from(err: &StackError) -> Self {
        let class = err.class();
        Self {
            class: class.to_string(),
            message: err.to_string(),
            digest: error_digest(class, &err.root_cause()),
        }
    }
}

/// One entry of the run event log
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    /// Per-run sequence, assigned by the store on append
    pub seq: u64,
    pub ts_ns: i64,
    pub run_id: String,
    /// Empty for stack-scoped events
    pub node_id: String,
    pub event_type: EventType,
    pub attempt: u32,
    pub message: String,
    pub fields: BTreeMap<String, Value>,
    pub error: Option<RunError>,
    pub prev_digest: String,
    pub digest: String,
    pub crc32: String,
}

impl RunEvent {
    pub fn new(run_id: impl Into<String>, node_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            seq: 0,
            ts_ns: now_ns(),
            run_id: run_id.into(),
            node_id: node_id.into(),
            event_type,
            attempt: 0,
            message: String::new(),
            fields: BTreeMap::new(),
            error: None,
            prev_digest: String::new(),
            digest: String::new(),
            crc32: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_error(mut self, error: RunError) -> Self {
        self.error = Some(error);
        self
    }

    /// Set the field map; the version key is added here
    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields.into_map();
        self
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn ts(&self) -> String {
        format_ts(self.ts_ns)
    }

    /// One line of the JSON event stream
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EventLine<'a> {
    seq: u64,
    ts: String,
    run_id: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    node_id: &'a str,
    attempt: u32,
    message: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fields: &'a BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RunError>,
    #[serde(skip_serializing_if = "str::is_empty")]
    prev_digest: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    digest: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    crc32: &'a str,
}

impl Serialize for RunEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        EventLine {
            seq: self.seq,
            ts: self.ts(),
            run_id: &self.run_id,
            event_type: self.event_type.as_str(),
            node_id: &self.node_id,
            attempt: self.attempt,
            message: &self.message,
            fields: &self.fields,
            error: self.error.as_ref(),
            prev_digest: &self.prev_digest,
            digest: &self.digest,
            crc32: &self.crc32,
        }
        .serialize(serializer)
    }
}

/// Builder for event field maps
#[derive(Debug, Clone, Default)]
pub struct Fields(BTreeMap<String, Value>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn into_map(mut self) -> BTreeMap<String, Value> {
        self.0
            .insert("v".to_string(), Value::from(EVENT_FIELDS_VERSION));
        self.0
    }
}

pub fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// RFC3339 UTC with nanoseconds; used both for display and in event digests
pub fn format_ts(ts_ns: i64) -> String {
    DateTime::<Utc>::from_timestamp_nanos(ts_ns).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Receives every event as it is produced, in Seq order
pub trait RunEventObserver: Send + Sync {
    fn observe_run_event(&self, event: &RunEvent);
}

/// Forwards events into an mpsc channel for renderers running on their own task
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl RunEventObserver for ChannelObserver {
    fn observe_run_event(&self, event: &RunEvent) {
        // receiver gone means the renderer exited
        let _ = self.tx.send(event.clone());
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<RunEvent>;

/// Create an observer plus the receiving end of its channel
pub fn event_channel() -> (Arc<dyn RunEventObserver>, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelObserver { tx }), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip_names() {
        for t in EventType::ALL {
            assert_eq!(EventType::parse(t.as_str()), Some(t));
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert!(EventType::NodeLog.is_ephemeral());
        assert!(!EventType::HelmLog.is_ephemeral());
    }

    #[test]
    fn test_json_line_shape() {
        let ev = RunEvent::new("run-1", "c/ns/a", EventType::PhaseCompleted)
            .with_message("no-op (digest-match)")
            .with_fields(
                Fields::new()
                    .set("phase", "apply")
                    .set("status", "skipped"),
            );
        let v: Value = serde_json::from_str(&ev.to_json_line()).unwrap();
        assert_eq!(v["type"], "PHASE_COMPLETED");
        assert_eq!(v["nodeId"], "c/ns/a");
        assert_eq!(v["fields"]["status"], "skipped");
        assert_eq!(v["fields"]["v"], 1);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn test_format_ts_has_nanos() {
        assert_eq!(format_ts(1_500_000_000_123_456_789), "2017-07-14T02:40:00.123456789Z");
    }

    #[tokio::test]
    async fn test_channel_observer_forwards() {
        let (observer, mut rx) = event_channel();
        observer.observe_run_event(&RunEvent::new("r", "", EventType::RunStarted));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type, EventType::RunStarted);
    }

    #[test]
    fn test_run_error_digest() {
        let err = RunError::new("HOOK_FAILED", "exit status 1");
        assert_eq!(err.digest, error_digest("HOOK_FAILED", "exit status 1"));
    }
}
