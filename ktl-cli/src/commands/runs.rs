use crate::commands::StackContext;
use crate::output::{self, OutputFormat};

use clap::Args;
use color_eyre::Result;

use stack_service::state::RunListEntry;
use stack_service::StateStore;

/// List recorded runs, newest first
#[derive(Args, Debug)]
pub struct RunsArgs {
    /// Maximum runs to list
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub fn execute(ctx: &StackContext, args: RunsArgs) -> Result<()> {
    let store = StateStore::open_read_only(&ctx.root)?;
    let runs = store.list_runs(args.limit)?;

    match OutputFormat::resolve(ctx.output, None) {
        OutputFormat::Json => output::json(&runs),
        OutputFormat::Table => {
            if runs.is_empty() {
                output::info("no runs recorded");
                return Ok(());
            }
            println!("{}", runs_table(&runs));
            Ok(())
        }
    }
}

pub fn runs_table(runs: &[RunListEntry]) -> String {
    let rows: Vec<Vec<String>> = runs
        .iter()
        .map(|r| {
            let totals = r
                .totals
                .map(|t| {
                    format!(
                        "{}/{} ok, {} failed, {} blocked",
                        t.succeeded, t.planned, t.failed, t.blocked
                    )
                })
                .unwrap_or_else(|| "-".to_string());
            vec![
                r.run_id.clone(),
                r.command.clone(),
                r.status.clone(),
                r.created_at.clone(),
                totals,
            ]
        })
        .collect();
    output::table(&["RUN", "COMMAND", "STATUS", "CREATED", "TOTALS"], &rows)
}
