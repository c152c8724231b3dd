use crate::commands::StackContext;
use crate::output::{self, OutputFormat};

use clap::Args;
use color_eyre::Result;

use stack_service::audit::DEFAULT_EVENTS_LIMIT;
use stack_service::{load_audit, AuditOptions, RunAudit};

/// Produce an audit report for a run
#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Run to audit (defaults to the most recent)
    #[arg(long, default_value = "")]
    pub run_id: String,

    /// Recompute the event chain and run digest
    #[arg(long)]
    pub verify: bool,

    /// Include the event log in the report
    #[arg(long)]
    pub events: bool,

    /// Maximum events to include (newest kept)
    #[arg(long, default_value_t = DEFAULT_EVENTS_LIMIT)]
    pub events_limit: usize,

    /// Include the recorded plan in the report
    #[arg(long)]
    pub plan: bool,
}

pub fn execute(ctx: &StackContext, args: AuditArgs) -> Result<()> {
    let audit = load_audit(&AuditOptions {
        root: ctx.root.clone(),
        run_id: args.run_id,
        verify: args.verify,
        events_limit: args.events_limit,
        include_plan: args.plan,
        include_events: args.events,
    })?;

    match OutputFormat::resolve(ctx.output, None) {
        OutputFormat::Json => output::json(&audit)?,
        OutputFormat::Table => print_audit(&audit),
    }

    // a failed verification must fail the command even when rendered
    if audit.integrity.as_ref().is_some_and(|i| !i.ok()) {
        std::process::exit(2);
    }
    Ok(())
}

fn print_audit(audit: &RunAudit) {
    output::header(&format!("audit {} ({})", audit.run_id, audit.api_version));

    let mut rows: Vec<Vec<String>> = vec![
        vec!["stack".into(), format!("{} ({})", audit.stack_name, audit.stack_root)],
        vec!["command".into(), audit.command.clone()],
        vec!["status".into(), audit.status.clone()],
        vec!["created".into(), audit.created_at.clone()],
        vec!["updated".into(), audit.updated_at.clone()],
    ];
    let optional = [
        ("profile", &audit.profile),
        ("completed", &audit.completed_at),
        ("created by", &audit.created_by),
        ("host", &audit.host),
        ("ci run", &audit.ci_run_url),
        ("git author", &audit.git_author),
        ("kubeconfig", &audit.kubeconfig),
        ("context", &audit.kube_context),
        ("plan hash", &audit.plan_hash),
        ("run digest", &audit.run_digest),
        ("state", &audit.state_path),
    ];
    for (label, value) in optional {
        if !value.is_empty() {
            rows.push(vec![label.to_string(), value.clone()]);
        }
    }
    if audit.pid > 0 {
        rows.push(vec!["pid".into(), audit.pid.to_string()]);
    }
    rows.push(vec!["follow".into(), audit.follow_command.clone()]);
    println!("{}", output::table(&["FIELD", "VALUE"], &rows));

    println!();
    output::print_result(&audit.summary);

    if !audit.failure_clusters.is_empty() {
        println!();
        output::header("failure clusters");
        let rows: Vec<Vec<String>> = audit
            .failure_clusters
            .iter()
            .map(|c| {
                vec![
                    c.error_class.clone(),
                    c.failed_events.to_string(),
                    c.affected_nodes.to_string(),
                    c.example_node_ids.join(","),
                    c.message.clone(),
                ]
            })
            .collect();
        println!(
            "{}",
            output::table(&["CLASS", "EVENTS", "NODES", "EXAMPLES", "MESSAGE"], &rows)
        );
    }

    if let Some(integrity) = &audit.integrity {
        println!();
        if integrity.events_ok {
            output::success(&format!("event chain ok ({})", integrity.last_event_digest));
        } else {
            output::failure(&format!("event chain: {}", integrity.events_error));
        }
        if integrity.run_digest_ok {
            output::success("run digest ok");
        } else {
            output::failure(&format!("run digest: {}", integrity.run_digest_error));
        }
    }

    if !audit.events.is_empty() {
        println!();
        output::header(&format!("events ({})", audit.events.len()));
        for ev in &audit.events {
            println!("{}", ev.to_json_line());
        }
    }
}
