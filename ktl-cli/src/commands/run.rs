use crate::commands::{load_selected, SelectorArgs, StackContext};
use crate::output::{self, OutputFormat};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use stack_service::backend::ClusterClient;
use stack_service::config::{RunCliConfig, DEFAULT_LOCK_TTL};
use stack_service::execution::{event_channel, new_run_id, RunOutcome};
use stack_service::{
    resolve_cli_config, resolve_runner_settings, Coordinator, FailMode, HelmBackend,
    KubectlClusterClient, Plan, RunOptions, RunnerRegistry, StackCommand, StateStore,
};

/// Flags for `apply` and `delete`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub selector: SelectorArgs,

    #[command(flatten)]
    pub exec: ExecArgs,
}

/// Execution flags shared by every command that runs a plan
#[derive(Args, Debug, Clone, Default)]
pub struct ExecArgs {
    /// Maximum releases in flight at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Stop scheduling new releases after the first failure
    #[arg(long, overrides_with = "continue_on_error")]
    pub fail_fast: bool,

    /// Keep running independent releases after a failure
    #[arg(long, overrides_with = "fail_fast")]
    pub continue_on_error: bool,

    /// Start with one worker and widen on success
    #[arg(long)]
    pub progressive: bool,

    /// Cap releases in flight per namespace (0 = unlimited)
    #[arg(long)]
    pub max_parallel_per_namespace: Option<usize>,

    /// Attempts per release including the first; only transient backend errors retry
    #[arg(long)]
    pub retry: Option<u32>,

    /// Base delay between release attempts (e.g. 2s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub retry_backoff: Option<Duration>,

    /// Default attempts for hooks that do not set `retry`
    #[arg(long)]
    pub hook_retry: Option<u32>,

    /// Base delay between hook attempts (e.g. 500ms)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub hook_backoff: Option<Duration>,

    /// Kubeconfig for releases that do not name one
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Kube context for releases that do not name one
    #[arg(long = "context")]
    pub kube_context: Option<String>,

    /// Hold the stack lock for the duration of the run
    #[arg(long, overrides_with = "no_lock")]
    pub lock: bool,

    /// Run without taking the stack lock
    #[arg(long, overrides_with = "lock")]
    pub no_lock: bool,

    /// Steal the stack lock from another holder
    #[arg(long)]
    pub takeover: bool,

    /// How long the lock stays valid if this process dies
    #[arg(long, value_parser = humantime::parse_duration)]
    pub lock_ttl: Option<Duration>,

    /// Skip the kubectl connectivity check before the run
    #[arg(long)]
    pub skip_preflight: bool,

    /// Show the live dashboard instead of progress lines
    #[arg(long)]
    pub ui: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub enabled: bool,
    pub takeover: bool,
    pub ttl: Duration,
    pub owner: String,
}

impl ExecArgs {
    /// Layer `cli.<command>` config and then flags over resolved runner settings
    pub fn apply_to(&self, opts: &mut RunOptions, cli: &RunCliConfig) {
        if let Some(fail_fast) = cli.fail_fast {
            opts.fail_mode = FailMode::from_fail_fast(fail_fast);
        }
        if self.fail_fast {
            opts.fail_mode = FailMode::FailFast;
        } else if self.continue_on_error {
            opts.fail_mode = FailMode::Continue;
        }
        if let Some(retry) = self.retry.or(cli.retry) {
            opts.max_attempts = retry.max(1);
        }
        if let Some(n) = self.concurrency {
            opts.concurrency = n;
        }
        opts.progressive_concurrency |= self.progressive;
        if let Some(n) = self.max_parallel_per_namespace {
            opts.max_parallel_per_namespace = n;
        }
        if let Some(d) = self.retry_backoff {
            opts.retry_backoff = d;
        }
        if let Some(n) = self.hook_retry {
            opts.hook_retry.default_attempts = n.max(1);
        }
        if let Some(d) = self.hook_backoff {
            opts.hook_retry.base_backoff = d;
            opts.hook_retry.max_backoff = opts.hook_retry.max_backoff.max(d);
        }
        if let Some(k) = &self.kubeconfig {
            opts.kubeconfig = k.clone();
        }
        if let Some(c) = &self.kube_context {
            opts.kube_context = c.clone();
        }
    }

    pub fn lock_settings(&self, cli: &RunCliConfig) -> LockSettings {
        let enabled = if self.no_lock {
            false
        } else if self.lock {
            true
        } else {
            cli.lock.enabled.unwrap_or(true)
        };
        LockSettings {
            enabled,
            takeover: self.takeover || cli.lock.takeover.unwrap_or(false),
            ttl: self.lock_ttl.or(cli.lock.ttl).unwrap_or(DEFAULT_LOCK_TTL),
            owner: cli.lock.owner.clone().unwrap_or_default(),
        }
    }
}

/// Everything needed to start a run
pub struct Launch {
    pub plan: Plan,
    pub opts: RunOptions,
    pub lock: LockSettings,
    pub output: OutputFormat,
    pub ui: bool,
    pub preflight: bool,
}

pub async fn execute(ctx: &StackContext, command: StackCommand, args: RunArgs) -> Result<()> {
    let stack = load_selected(ctx, &args.selector)?;
    if stack.plan.nodes.is_empty() {
        output::warning("selector matched no releases; nothing to do");
        return Ok(());
    }

    let settings = resolve_runner_settings(&stack.universe, &ctx.profile)?;
    let cli = resolve_cli_config(&stack.universe, &ctx.profile)?;
    let run_cli = cli.for_command(command);

    let mut opts = RunOptions::from_settings(command, &settings);
    opts.selector = stack.selector.clone();
    args.exec.apply_to(&mut opts, run_cli);

    launch(
        &ctx.root,
        Launch {
            plan: stack.plan,
            opts,
            lock: args.exec.lock_settings(run_cli),
            output: stack.output,
            ui: args.exec.ui,
            preflight: !args.exec.skip_preflight,
        },
    )
    .await
}

/// Lock, run and report; exits non-zero when the run did not succeed
pub async fn launch(root: &Path, launch: Launch) -> Result<()> {
    let Launch {
        plan,
        mut opts,
        lock,
        output: format,
        ui,
        preflight,
    } = launch;
    if opts.run_id.is_empty() {
        opts.run_id = new_run_id();
    }
    if preflight {
        check_clusters(&plan, &opts).await?;
    }

    let store = Arc::new(StateStore::open(root)?);
    let held = if lock.enabled {
        Some(store.acquire_lock(&lock.owner, &opts.run_id, lock.ttl, lock.takeover)?)
    } else {
        None
    };

    let result = drive(store.clone(), plan, opts, format, ui).await;

    if let Some(held) = held {
        if let Err(err) = store.release_lock(&held.owner, &held.run_id) {
            tracing::warn!(error = %err, "failed to release stack lock");
        }
    }
    let outcome = result?;

    if format == OutputFormat::Table {
        print_outcome(root, &outcome);
    }
    if !outcome.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

async fn drive(
    store: Arc<StateStore>,
    plan: Plan,
    opts: RunOptions,
    format: OutputFormat,
    ui: bool,
) -> Result<RunOutcome> {
    let cancel = opts.cancel.clone();
    let title = format!("ktl stack {} {}", opts.command.as_str(), plan.stack_name);
    let (observer, mut rx) = event_channel();
    let coordinator = Coordinator::new(
        Arc::new(HelmBackend::new()),
        Arc::new(RunnerRegistry::new()),
    )
    .with_store(store)
    .with_observer(observer);

    // Execute in the background, render in the foreground
    let handle = tokio::spawn(async move { coordinator.run(&plan, opts).await });

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                output::warning("interrupt received; waiting for in-flight releases");
                cancel.cancel();
            }
        })
    };

    if ui {
        if let Err(err) = stack_tui::run_dashboard(title, rx, cancel.clone()).await {
            cancel.cancel();
            let _ = handle.await;
            interrupt.abort();
            return Err(err);
        }
    } else {
        while let Some(event) = rx.recv().await {
            match format {
                OutputFormat::Json => println!("{}", event.to_json_line()),
                OutputFormat::Table => output::print_event(&event),
            }
        }
    }
    interrupt.abort();

    Ok(handle.await??)
}

/// Probe every cluster the plan touches before anything is changed
async fn check_clusters(plan: &Plan, opts: &RunOptions) -> Result<()> {
    let client = KubectlClusterClient::new(opts.kubeconfig.clone(), opts.kube_context.clone());
    for (name, nodes) in plan.by_cluster() {
        let Some(first) = nodes.first() else {
            continue;
        };
        match client.check(&first.cluster).await {
            Ok(version) => output::status("Connected", &format!("cluster {} ({})", name, version)),
            Err(err) => bail!(
                "cluster {} is unreachable: {} (use --skip-preflight to run anyway)",
                name,
                err
            ),
        }
    }
    Ok(())
}

fn print_outcome(root: &Path, outcome: &RunOutcome) {
    output::print_result(&outcome.summary);
    if let Some(err) = &outcome.first_error {
        output::error(err);
    }
    let root_flag = if root == Path::new(".") {
        String::new()
    } else {
        format!(" --root {}", root.display())
    };
    output::info(&format!(
        "audit: ktl stack{} audit --run-id {} --verify",
        root_flag, outcome.run_id
    ));
    if !outcome.succeeded() {
        output::info(&format!(
            "resume: ktl stack{} resume --run-id {}",
            root_flag, outcome.run_id
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_service::config::LockConfig;

    #[test]
    fn test_flags_override_config_and_settings() {
        let cli = RunCliConfig {
            fail_fast: Some(false),
            retry: Some(3),
            lock: LockConfig::default(),
        };
        let mut opts = RunOptions::new(StackCommand::Apply);
        ExecArgs::default().apply_to(&mut opts, &cli);
        assert_eq!(opts.fail_mode, FailMode::Continue);
        assert_eq!(opts.max_attempts, 3);

        let flags = ExecArgs {
            fail_fast: true,
            retry: Some(1),
            concurrency: Some(2),
            hook_retry: Some(4),
            hook_backoff: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let mut opts = RunOptions::new(StackCommand::Apply);
        flags.apply_to(&mut opts, &cli);
        assert_eq!(opts.fail_mode, FailMode::FailFast);
        assert_eq!(opts.max_attempts, 1);
        assert_eq!(opts.concurrency, 2);
        assert_eq!(opts.hook_retry.default_attempts, 4);
        assert_eq!(opts.hook_retry.base_backoff, Duration::from_secs(30));
        assert!(opts.hook_retry.max_backoff >= Duration::from_secs(30));
    }

    #[test]
    fn test_lock_settings_resolution() {
        let cli = RunCliConfig {
            lock: LockConfig {
                enabled: Some(false),
                takeover: None,
                ttl: Some(Duration::from_secs(60)),
                owner: Some("ci".into()),
            },
            ..Default::default()
        };
        let from_config = ExecArgs::default().lock_settings(&cli);
        assert!(!from_config.enabled);
        assert_eq!(from_config.ttl, Duration::from_secs(60));
        assert_eq!(from_config.owner, "ci");

        let forced = ExecArgs {
            lock: true,
            takeover: true,
            ..Default::default()
        }
        .lock_settings(&cli);
        assert!(forced.enabled);
        assert!(forced.takeover);

        let default = ExecArgs::default().lock_settings(&RunCliConfig::default());
        assert!(default.enabled);
        assert_eq!(default.ttl, DEFAULT_LOCK_TTL);
    }
}
