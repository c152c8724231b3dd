use crate::commands::{load_selected, SelectorArgs, StackContext};
use crate::output::{self, OutputFormat};

use clap::Args;
use color_eyre::Result;

use stack_service::state::RunPlan;
use stack_service::{resolve_runner_settings, Plan, StackCommand};

/// Show the ordered plan without touching any cluster
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub selector: SelectorArgs,

    /// Order nodes for a delete run instead of an apply run
    #[arg(long)]
    pub delete: bool,
}

pub fn execute(ctx: &StackContext, args: PlanArgs) -> Result<()> {
    let stack = load_selected(ctx, &args.selector)?;
    let command = if args.delete {
        StackCommand::Delete
    } else {
        StackCommand::Apply
    };

    match stack.output {
        OutputFormat::Json => {
            let settings = resolve_runner_settings(&stack.universe, &ctx.profile)?;
            let run_plan = RunPlan::build(
                "",
                &stack.plan,
                command,
                settings.concurrency,
                settings.fail_mode,
                &stack.selector,
            )?;
            output::json(&run_plan)
        }
        OutputFormat::Table => {
            if stack.plan.nodes.is_empty() {
                output::warning("selector matched no releases");
                return Ok(());
            }
            output::header(&format!(
                "{} {}: {} releases",
                command.as_str(),
                stack.plan.stack_name,
                stack.plan.nodes.len()
            ));
            println!("{}", plan_table(&stack.plan, command));
            Ok(())
        }
    }
}

/// Rows in execution order; delete runs walk the groups backwards
pub fn plan_table(plan: &Plan, command: StackCommand) -> String {
    let mut nodes: Vec<_> = plan.nodes.iter().collect();
    nodes.sort_by(|a, b| a.execution_group.cmp(&b.execution_group).then(a.id.cmp(&b.id)));
    if command == StackCommand::Delete {
        nodes.reverse();
    }
    let rows: Vec<Vec<String>> = nodes
        .iter()
        .map(|n| {
            vec![
                n.execution_group.to_string(),
                n.id.clone(),
                if n.needs.is_empty() {
                    "-".to_string()
                } else {
                    n.needs.join(",")
                },
                if n.selected_by.is_empty() {
                    "-".to_string()
                } else {
                    n.selected_by.join(",")
                },
            ]
        })
        .collect();
    output::table(&["GROUP", "ID", "NEEDS", "SELECTED-BY"], &rows)
}
