// Stack configuration
// stack.yaml / release.yaml models, discovery and runner settings

pub mod discovery;
pub mod error;
pub mod models;
pub mod runner;

pub use discovery::{discover, DiscoveredRelease, Universe};
pub use error::{ConfigError, ConfigErrorKind, ConfigResult};
pub use models::*;
pub use runner::{
    default_concurrency, resolve_cli_config, resolve_runner_settings, FailMode, HookRetryPolicy,
    RunnerSettings, DEFAULT_HOOK_TIMEOUT, DEFAULT_LOCK_TTL,
};
