pub mod audit;
pub mod plan;
pub mod resume;
pub mod run;
pub mod runs;
pub mod status;

use std::path::PathBuf;

use clap::{Args, Subcommand};
use color_eyre::Result;

use stack_service::config::{SelectorConfig, Universe};
use stack_service::{load_stack, resolve_cli_config, select, Plan, RunSelector};

use crate::output::OutputFormat;

/// `ktl stack` and the flags every subcommand shares
#[derive(Args, Debug)]
pub struct StackArgs {
    #[command(flatten)]
    pub context: StackContext,

    #[command(subcommand)]
    pub command: StackCommands,
}

#[derive(Args, Debug, Clone)]
pub struct StackContext {
    /// Stack root directory (holds stack.yaml and .ktl/)
    #[arg(long, env = "KTL_STACK_DIR", default_value = ".", global = true)]
    pub root: PathBuf,

    /// Profile overlay from stack.yaml
    #[arg(long, env = "KTL_STACK_PROFILE", default_value = "", global = true)]
    pub profile: String,

    /// Output format (defaults to the stack's cli.output, then table)
    #[arg(long, short = 'o', value_enum, global = true)]
    pub output: Option<OutputFormat>,

    /// Log filter for diagnostics on stderr (RUST_LOG takes precedence)
    #[arg(long, env = "KTL_LOG_LEVEL", default_value = "warn", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum StackCommands {
    /// Show the ordered plan without touching any cluster
    Plan(plan::PlanArgs),
    /// Install or upgrade the selected releases
    Apply(run::RunArgs),
    /// Uninstall the selected releases in reverse dependency order
    Delete(run::RunArgs),
    /// Finish a previous run from its recorded state
    Resume(resume::ResumeArgs),
    /// Show a run's summary and recent events
    Status(status::StatusArgs),
    /// List recorded runs, newest first
    Runs(runs::RunsArgs),
    /// Produce an audit report for a run, optionally verifying integrity
    Audit(audit::AuditArgs),
}

/// Release selection flags; each overrides the stack's `cli.selector`
#[derive(Args, Debug, Clone, Default)]
pub struct SelectorArgs {
    /// Only releases carrying this tag (repeatable)
    #[arg(long = "tag", value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Only releases targeting this cluster (repeatable)
    #[arg(long = "cluster", value_delimiter = ',')]
    pub clusters: Vec<String>,

    /// Only these releases, by name or node id (repeatable)
    #[arg(long = "release", value_delimiter = ',')]
    pub releases: Vec<String>,

    /// Only releases declared under this path (repeatable)
    #[arg(long = "from-path", value_delimiter = ',')]
    pub from_paths: Vec<String>,

    /// Only releases whose inputs changed in this git range (e.g. origin/main...HEAD)
    #[arg(long)]
    pub git_range: Option<String>,

    /// Also select what the selected releases depend on
    #[arg(long)]
    pub include_deps: bool,

    /// Also select releases that depend on the selection
    #[arg(long)]
    pub include_dependents: bool,

    /// Drop needs that point outside the selection instead of failing
    #[arg(long)]
    pub allow_missing_deps: bool,
}

impl SelectorArgs {
    /// Flags layered over the configured selector
    pub fn resolve(&self, cfg: &SelectorConfig) -> RunSelector {
        let mut sel = RunSelector::from_config(cfg);
        if !self.tags.is_empty() {
            sel.tags = self.tags.clone();
        }
        if !self.clusters.is_empty() {
            sel.clusters = self.clusters.clone();
        }
        if !self.releases.is_empty() {
            sel.releases = self.releases.clone();
        }
        if !self.from_paths.is_empty() {
            sel.from_paths = self.from_paths.clone();
        }
        if let Some(range) = &self.git_range {
            sel.git_range = range.clone();
        }
        sel.include_deps |= self.include_deps;
        sel.include_dependents |= self.include_dependents;
        sel.allow_missing_deps |= self.allow_missing_deps;
        sel
    }
}

/// A compiled stack narrowed by the selector
pub struct SelectedStack {
    pub universe: Universe,
    pub plan: Plan,
    pub selector: RunSelector,
    pub output: OutputFormat,
}

pub fn load_selected(ctx: &StackContext, selector: &SelectorArgs) -> Result<SelectedStack> {
    let (universe, full) = load_stack(&ctx.root, &ctx.profile)?;
    let cli = resolve_cli_config(&universe, &ctx.profile)?;
    let selector = selector.resolve(&cli.selector);
    let plan = select(&full, &selector)?;
    let output = OutputFormat::resolve(ctx.output, cli.output.as_deref());
    tracing::debug!(
        root = %ctx.root.display(),
        total = full.nodes.len(),
        selected = plan.nodes.len(),
        "stack loaded"
    );
    Ok(SelectedStack {
        universe,
        plan,
        selector,
        output,
    })
}

pub async fn execute(args: StackArgs) -> Result<()> {
    let ctx = args.context;
    match args.command {
        StackCommands::Plan(a) => plan::execute(&ctx, a),
        StackCommands::Apply(a) => run::execute(&ctx, stack_service::StackCommand::Apply, a).await,
        StackCommands::Delete(a) => run::execute(&ctx, stack_service::StackCommand::Delete, a).await,
        StackCommands::Resume(a) => resume::execute(&ctx, a).await,
        StackCommands::Status(a) => status::execute(&ctx, a).await,
        StackCommands::Runs(a) => runs::execute(&ctx, a),
        StackCommands::Audit(a) => audit::execute(&ctx, a),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(subcommand)]
        command: TestCommands,
    }

    #[derive(Subcommand, Debug)]
    enum TestCommands {
        Stack(StackArgs),
    }

    fn parse(args: &[&str]) -> StackArgs {
        let mut argv = vec!["ktl", "stack"];
        argv.extend_from_slice(args);
        match TestCli::parse_from(argv).command {
            TestCommands::Stack(a) => a,
        }
    }

    #[test]
    fn test_global_flags_before_and_after_subcommand() {
        let before = parse(&["--root", "/stacks/prod", "status", "--run-id", "r1"]);
        assert_eq!(before.context.root, PathBuf::from("/stacks/prod"));
        assert!(matches!(before.command, StackCommands::Status(ref s) if s.run_id == "r1"));

        let after = parse(&["apply", "--root", "/stacks/dev", "-o", "json", "--tag", "web,api"]);
        assert_eq!(after.context.root, PathBuf::from("/stacks/dev"));
        assert_eq!(after.context.output, Some(OutputFormat::Json));
        match after.command {
            StackCommands::Apply(run) => assert_eq!(run.selector.tags, vec!["web", "api"]),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_selector_flags_override_config() {
        let cfg = SelectorConfig {
            tags: vec!["core".into()],
            clusters: vec!["prod".into()],
            include_deps: Some(true),
            ..Default::default()
        };
        let flags = SelectorArgs {
            tags: vec!["web".into()],
            include_dependents: true,
            ..Default::default()
        };
        let sel = flags.resolve(&cfg);
        assert_eq!(sel.tags, vec!["web"]);
        assert_eq!(sel.clusters, vec!["prod"]);
        assert!(sel.include_deps);
        assert!(sel.include_dependents);
        assert!(!sel.allow_missing_deps);
    }
}
