// Execution Engine Module
// Runs a plan: scheduling, hooks, per-node phases and the hash-chained event log

pub mod coordinator;
pub mod events;
pub mod hooks;
pub mod node;
pub mod recorder;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use coordinator::{new_run_id, retry_backoff, Coordinator, RunOptions, RunOutcome};
pub use events::{
    event_channel, format_ts, now_ns, EventReceiver, EventType, Fields, RunError, RunEvent,
    RunEventObserver,
};
pub use hooks::{HookEngine, HookStatus};
pub use node::{NodeExecutor, NodeFailure};
pub use recorder::RunRecorder;
pub use scheduler::{Blocked, Scheduler, Transition};
