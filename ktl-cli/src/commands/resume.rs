use crate::commands::run::{launch, ExecArgs, Launch};
use crate::commands::StackContext;
use crate::output::{self, OutputFormat};

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use stack_service::{
    load_run, load_stack, resolve_cli_config, resolve_runner_settings, resume_plan, RunOptions,
};

/// Finish a previous run from its recorded state
#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Run to resume (defaults to the most recent)
    #[arg(long, default_value = "")]
    pub run_id: String,

    /// Resume even if release inputs changed since the run
    #[arg(long)]
    pub allow_drift: bool,

    /// Only rerun releases that failed; blocked ones stay untouched
    #[arg(long)]
    pub rerun_failed: bool,

    #[command(flatten)]
    pub exec: ExecArgs,
}

pub async fn execute(ctx: &StackContext, args: ResumeArgs) -> Result<()> {
    let loaded = load_run(&ctx.root, &args.run_id)?;
    let command = loaded.command()?;
    let profile = if ctx.profile.is_empty() {
        loaded.run_plan.profile.clone()
    } else {
        ctx.profile.clone()
    };

    let (universe, current) = load_stack(&ctx.root, &profile)?;
    let cli = resolve_cli_config(&universe, &profile)?;
    let allow_drift = args.allow_drift || cli.resume.allow_drift.unwrap_or(false);
    let rerun_failed = args.rerun_failed || cli.resume.rerun_failed.unwrap_or(false);

    let drift = loaded.drift(&current);
    if !drift.is_empty() {
        if !allow_drift {
            bail!(
                "stack changed since run {}: {}; rerun with --allow-drift to resume anyway",
                loaded.run_id,
                drift.summary()
            );
        }
        output::warning(&format!("resuming despite drift: {}", drift.summary()));
    }

    let plan = resume_plan(&loaded, rerun_failed);
    if plan.nodes.is_empty() {
        output::success(&format!("run {} has nothing left to do", loaded.run_id));
        return Ok(());
    }
    output::header(&format!(
        "resuming {} run {}: {} releases",
        command.as_str(),
        loaded.run_id,
        plan.nodes.len()
    ));

    let settings = resolve_runner_settings(&universe, &profile)?;
    let run_cli = cli.for_command(command);
    let mut opts = RunOptions::from_settings(command, &settings);
    opts.fail_mode = loaded.fail_mode();
    opts.concurrency = loaded.run_plan.concurrency.max(1);
    opts.selector = loaded.run_plan.selector.clone();
    opts.initial_attempts = loaded.attempts();
    args.exec.apply_to(&mut opts, run_cli);
    // flags above win, but the recorded fail mode beats stack config
    if !args.exec.fail_fast && !args.exec.continue_on_error {
        opts.fail_mode = loaded.fail_mode();
    }

    let format = OutputFormat::resolve(ctx.output, cli.output.as_deref());
    launch(
        &ctx.root,
        Launch {
            plan,
            opts,
            lock: args.exec.lock_settings(run_cli),
            output: format,
            ui: args.exec.ui,
            preflight: !args.exec.skip_preflight,
        },
    )
    .await
}
