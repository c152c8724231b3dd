// Run Status
// Snapshot of a run plus a polling tail of its event log

use crate::error::StackResult;
use crate::execution::{EventType, RunEvent};
use crate::state::{RunSummary, StateStore};

use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Events shown when no limit is given
pub const DEFAULT_TAIL: usize = 50;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run_id: String,
    pub stack_root: String,
    pub stack_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub profile: String,
    pub command: String,
    pub summary: RunSummary,
    pub events: Vec<RunEvent>,
}

impl RunSnapshot {
    /// Seq of the newest event shown; following continues after it
    pub fn last_seq(&self) -> u64 {
        self.events.last().map(|e| e.seq).unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.event_type == EventType::RunCompleted)
    }
}

/// Summary and the last `limit` events of a run (empty id = most recent)
pub fn run_snapshot(store: &StateStore, run_id: &str, limit: usize) -> StackResult<RunSnapshot> {
    let run_id = match run_id.trim() {
        "" => store.most_recent_run_id()?,
        id => id.to_string(),
    };
    let record = store.get_run(&run_id)?;
    let summary = store.get_run_summary(&run_id)?;
    let limit = if limit == 0 { DEFAULT_TAIL } else { limit };
    let events = store.list_events(&run_id, limit)?;
    Ok(RunSnapshot {
        run_id,
        stack_root: record.stack_root,
        stack_name: record.stack_name,
        profile: record.profile,
        command: record.command,
        summary,
        events,
    })
}

/// Poll for events after `after_seq` until RUN_COMPLETED or cancellation
///
/// Returns the seq of the last event delivered.
pub async fn follow_events<F>(
    store: &StateStore,
    run_id: &str,
    mut after_seq: u64,
    interval: Duration,
    cancel: &CancellationToken,
    mut on_event: F,
) -> StackResult<u64>
where
    F: FnMut(&RunEvent),
{
    loop {
        let mut done = false;
        for ev in store.events_after(run_id, after_seq, 0)? {
            after_seq = ev.seq;
            done |= ev.event_type == EventType::RunCompleted;
            on_event(&ev);
        }
        if done {
            return Ok(after_seq);
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return Ok(after_seq),
        }
    }
}
