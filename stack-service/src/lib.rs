// Stack Service Library
// Core engine for `ktl stack`: release graphs, hooks, and durable hash-chained run state

pub mod audit;
pub mod backend;
pub mod config;
pub mod error;
pub mod execution;
pub mod resume;
pub mod runners;
pub mod stack;
pub mod state;
pub mod status;

// Re-export commonly used types
pub use error::{StackError, StackResult};

// Re-export configuration types
pub use config::{
    discover, resolve_cli_config, resolve_runner_settings, FailMode, HookPhase, HookSpec,
    HooksConfig, RunnerSettings, StackCommand,
};

// Re-export graph types
pub use stack::{
    compile, drift_report, load_stack, select, CompileOptions, DependencyGraph, DriftReport,
    Plan, ResolvedRelease, RunSelector,
};

// Re-export execution types
pub use execution::{
    event_channel, Coordinator, EventReceiver, EventType, RunEvent, RunEventObserver, RunOptions,
    RunOutcome,
};

// Re-export backend and runner types
pub use backend::{DeployBackend, HelmBackend, KubectlClusterClient};
pub use runners::{HookRunner, RunnerRegistry};

// Re-export state types
pub use audit::{audit_run, load_audit, AuditOptions, RunAudit};
pub use resume::{load_run, resume_plan, LoadedRun};
pub use state::{RunStatus, RunSummary, StackLock, StateStore};
pub use status::{follow_events, run_snapshot, RunSnapshot};
