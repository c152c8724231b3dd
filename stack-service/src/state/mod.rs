// State Module
// Durable run state: SQLite store, integrity chain, apply cache and stack lock

pub mod apply_cache;
pub mod integrity;
pub mod lock;
pub mod models;
pub mod store;

pub use apply_cache::{
    check_apply_cache, ApplyCacheDecision, ApplyCacheEntry, ApplyCacheKey, CacheReason,
};
pub use integrity::{compute_event_integrity, compute_plan_hash, compute_run_digest, verify_chain};
pub use lock::{default_lock_owner, StackLock};
pub use models::{
    FailureCluster, NewRun, NodeState, NodeStatus, NodeSummary, OperatorMeta, RunListEntry,
    RunPlan, RunRecord, RunStatus, RunSummary, RunTotals,
};
pub use store::{StateStore, StoreError, StoreResult, STATE_DB_REL_PATH};
