// Stack graph
// Resolver, dependency graph, selector and input fingerprints

pub mod compile;
pub mod git;
pub mod graph;
pub mod inputs;
pub mod merge;
pub mod models;
pub mod select;

pub use compile::{compile, load_stack, CompileOptions};
pub use graph::{DependencyGraph, GraphError, GraphErrorKind};
pub use inputs::{compute_effective_input_hash, drift_report, DriftReport, TOOL_VERSION};
pub use models::{Plan, ResolvedRelease};
pub use select::{map_changed_files, select, RunSelector};
