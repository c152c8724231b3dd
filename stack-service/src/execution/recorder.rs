// Run Recorder
// Single writer for a run's events: assigns Seq, links digests, fans out to observers

use super::events::{EventType, Fields, RunError, RunEvent, RunEventObserver};
use crate::error::{StackError, StackResult};
use crate::state::{compute_event_integrity, StateStore, StoreError};

use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ChainTail {
    seq: u64,
    digest: String,
    /// First store failure; once set, no further durable events are accepted
    fatal: Option<String>,
}

/// Serializes every event of one run
///
/// With a store, Seq and digests come from the committed row. Without one the
/// same chain is computed in memory so observers still see linked events.
pub struct RunRecorder {
    run_id: String,
    store: Option<Arc<StateStore>>,
    observers: Vec<Arc<dyn RunEventObserver>>,
    tail: Mutex<ChainTail>,
}

impl RunRecorder {
    pub fn new(
        run_id: impl Into<String>,
        store: Option<Arc<StateStore>>,
        observers: Vec<Arc<dyn RunEventObserver>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            store,
            observers,
            tail: Mutex::new(ChainTail::default()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> Option<&Arc<StateStore>> {
        self.store.as_ref()
    }

    /// Set when a store write has failed
    pub fn fatal_error(&self) -> Option<String> {
        self.tail.lock().ok().and_then(|t| t.fatal.clone())
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal_error().is_some()
    }

    /// Start building an event for this run
    pub fn event(&self, node_id: &str, event_type: EventType) -> RunEvent {
        RunEvent::new(self.run_id.clone(), node_id, event_type)
    }

    /// Append one event and notify observers
    ///
    /// Ephemeral events bypass the chain. Durable events fail once the store
    /// has failed, so callers stop scheduling new work.
    pub fn record(&self, mut ev: RunEvent) -> StackResult<RunEvent> {
        let mut tail = self
            .tail
            .lock()
            .map_err(|_| StackError::Store(StoreError::Poisoned))?;

        if ev.event_type.is_ephemeral() {
            self.notify(&ev);
            return Ok(ev);
        }
        if let Some(msg) = &tail.fatal {
            return Err(StackError::Store(StoreError::Integrity(format!(
                "event log unavailable after earlier failure: {}",
                msg
            ))));
        }

        match &self.store {
            Some(store) => {
                if let Err(err) = store.append_event(&mut ev) {
                    tracing::error!(run_id = %self.run_id, error = %err, "event append failed");
                    tail.fatal = Some(err.to_string());
                    return Err(StackError::Store(err));
                }
            }
            None => {
                ev.node_id = ev.node_id.trim().to_string();
                ev.message = ev.message.trim().to_string();
                ev.seq = tail.seq + 1;
                ev.prev_digest = tail.digest.clone();
                let (digest, crc) = compute_event_integrity(&ev);
                ev.digest = digest;
                ev.crc32 = crc;
            }
        }
        tail.seq = ev.seq;
        tail.digest = ev.digest.clone();
        self.notify(&ev);
        Ok(ev)
    }

    /// Emit a `NODE_LOG` line; never fails
    pub fn log(&self, node_id: &str, attempt: u32, message: impl Into<String>, fields: Fields) {
        let ev = self
            .event(node_id, EventType::NodeLog)
            .with_attempt(attempt)
            .with_message(message)
            .with_fields(fields);
        let _ = self.record(ev);
    }

    /// Shorthand for the common event shape
    pub fn emit(
        &self,
        node_id: &str,
        event_type: EventType,
        attempt: u32,
        message: impl Into<String>,
        fields: Fields,
        error: Option<RunError>,
    ) -> StackResult<RunEvent> {
        let mut ev = self
            .event(node_id, event_type)
            .with_attempt(attempt)
            .with_message(message)
            .with_fields(fields);
        ev.error = error;
        self.record(ev)
    }

    fn notify(&self, ev: &RunEvent) {
        for observer in &self.observers {
            observer.observe_run_event(ev);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::testing::CaptureObserver;
    use crate::state::verify_chain;

    #[test]
    fn test_in_memory_chain_links_events() {
        let capture = Arc::new(CaptureObserver::default());
        let rec = RunRecorder::new("r1", None, vec![capture.clone() as Arc<dyn RunEventObserver>]);
        rec.emit("", EventType::RunStarted, 0, "", Fields::new(), None)
            .unwrap();
        rec.log("c/ns/a", 1, "noise", Fields::new());
        rec.emit("c/ns/a", EventType::NodeRunning, 1, "", Fields::new(), None)
            .unwrap();

        let events = capture.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].event_type, EventType::NodeLog);
        assert_eq!(events[1].seq, 0);
        let durable: Vec<_> = events.iter().filter(|e| !e.event_type.is_ephemeral()).collect();
        assert_eq!(durable[0].seq, 1);
        assert_eq!(durable[1].seq, 2);
        assert_eq!(durable[1].prev_digest, durable[0].digest);
        verify_chain(durable.into_iter()).unwrap();
    }

    #[test]
    fn test_store_failure_is_sticky() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        // no run row: the events insert violates the foreign key
        let rec = RunRecorder::new("missing-run", Some(store), vec![]);
        let err = rec
            .emit("", EventType::RunStarted, 0, "", Fields::new(), None)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(rec.is_fatal());
        assert!(rec
            .emit("", EventType::RunCompleted, 0, "failed", Fields::new(), None)
            .is_err());
    }
}
