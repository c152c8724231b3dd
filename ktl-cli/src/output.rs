// Output formatting helpers for CLI commands
//
// Progress goes to stderr, results to stdout, so `--output json` stays parseable.

use stack_service::execution::{EventType, RunEvent};
use stack_service::state::{RunStatus, RunSummary};

/// `--output` formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human readable tables and progress lines
    Table,
    /// JSON documents; run commands stream one event per line
    Json,
}

impl OutputFormat {
    /// Flag value, falling back to the stack's `cli.output`
    pub fn resolve(flag: Option<OutputFormat>, configured: Option<&str>) -> Self {
        match (flag, configured.map(str::trim)) {
            (Some(f), _) => f,
            (None, Some("json")) => OutputFormat::Json,
            _ => OutputFormat::Table,
        }
    }
}

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

/// Print a warning message
pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

/// Print an info message
pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

/// Print a dim/muted message
pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Print a JSON document to stdout
pub fn json<T: serde::Serialize>(value: &T) -> color_eyre::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Left-aligned columns sized to the widest cell
pub fn table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }
    let render = |cells: Vec<&str>| {
        let last = cells.len().saturating_sub(1);
        cells
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if i == last {
                    c.to_string()
                } else {
                    format!("{:<width$}", c, width = widths[i])
                }
            })
            .collect::<Vec<_>>()
            .join("  ")
    };
    let mut out = vec![render(headers.to_vec())];
    for row in rows {
        out.push(render(row.iter().map(String::as_str).collect()));
    }
    out.join("\n")
}

/// Machine-greppable result block printed after every run
///
/// ```text
/// RESULT	failed	(planned=3 succeeded=1 failed=1 blocked=1)
/// c1/ns/api	failed	1	apply failed: boom
/// ```
pub fn result_lines(summary: &RunSummary) -> Vec<String> {
    let t = &summary.totals;
    let mut lines = vec![format!(
        "RESULT\t{}\t(planned={} succeeded={} failed={} blocked={})",
        summary.status.as_str(),
        t.planned,
        t.succeeded,
        t.failed,
        t.blocked
    )];
    let ids: Vec<&String> = if summary.order.is_empty() {
        summary.nodes.keys().collect()
    } else {
        summary.order.iter().collect()
    };
    for id in ids {
        if let Some(node) = summary.nodes.get(id) {
            let mut line = format!("{}\t{}\t{}", id, node.status.as_str(), node.attempt);
            if !node.error.is_empty() {
                line.push('\t');
                line.push_str(&node.error);
            }
            lines.push(line);
        }
    }
    lines
}

pub fn print_result(summary: &RunSummary) {
    for line in result_lines(summary) {
        println!("{}", line);
    }
}

/// One progress line per event for interactive runs; None for chatter
pub fn event_line(ev: &RunEvent) -> Option<String> {
    let node = ev.node_id.as_str();
    let text = match ev.event_type {
        EventType::RunStarted => format!("run {} started: {}", ev.run_id, ev.message),
        EventType::RunCompleted => format!("run {} {}", ev.run_id, ev.message),
        EventType::RunConcurrency => ev.message.clone(),
        EventType::NodeRunning if ev.attempt > 1 => format!("{} running (attempt {})", node, ev.attempt),
        EventType::NodeRunning => format!("{} running", node),
        EventType::NodeSucceeded => format!("{} succeeded", node),
        EventType::NodeFailed => {
            let err = ev.error.as_ref().map(|e| e.message.as_str()).unwrap_or(&ev.message);
            format!("{} failed: {}", node, err)
        }
        EventType::NodeBlocked => format!(
            "{} blocked: {}",
            node,
            ev.field_str("reason").unwrap_or(&ev.message)
        ),
        EventType::RetryScheduled => format!("{} {}", node, ev.message),
        EventType::BudgetWait => format!("{} {}", node, ev.message),
        EventType::HookFailed => format!("{} {}", scope(node), ev.message),
        EventType::HookSucceeded => format!(
            "{} hook {} {} succeeded",
            scope(node),
            ev.field_str("phase").unwrap_or_default(),
            ev.field_str("hook").unwrap_or_default()
        ),
        EventType::PhaseCompleted if ev.field_str("status") == Some("failed") => {
            format!("{} phase {} failed", node, ev.field_str("phase").unwrap_or_default())
        }
        EventType::NodeLog => format!("{} {}", scope(node), ev.message),
        _ => return None,
    };
    Some(text)
}

fn scope(node: &str) -> &str {
    if node.is_empty() {
        "stack"
    } else {
        node
    }
}

/// Render one event as an interactive progress line
pub fn print_event(ev: &RunEvent) {
    let Some(line) = event_line(ev) else {
        return;
    };
    match ev.event_type {
        EventType::RunStarted => header(&line),
        EventType::RunCompleted => {
            if ev.field_str("status") == Some(RunStatus::Succeeded.as_str()) {
                success(&line)
            } else {
                failure(&line)
            }
        }
        EventType::NodeSucceeded | EventType::HookSucceeded => success(&line),
        EventType::NodeFailed | EventType::HookFailed | EventType::PhaseCompleted => failure(&line),
        EventType::NodeBlocked | EventType::RetryScheduled | EventType::BudgetWait => warning(&line),
        EventType::NodeLog => dim(&format!("    {}", line)),
        _ => status("Running", &line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_service::execution::{Fields, RunError};
    use stack_service::state::{NodeStatus, NodeSummary};

    #[test]
    fn test_result_lines_follow_plan_order() {
        let mut summary = RunSummary::planned(
            "r1",
            vec!["c/ns/db".into(), "c/ns/api".into()],
            "2024-01-01T00:00:00Z".into(),
        );
        summary.status = RunStatus::Failed;
        summary.nodes.insert(
            "c/ns/db".into(),
            NodeSummary {
                status: NodeStatus::Succeeded,
                attempt: 1,
                error: String::new(),
            },
        );
        summary.nodes.insert(
            "c/ns/api".into(),
            NodeSummary {
                status: NodeStatus::Failed,
                attempt: 2,
                error: "c/ns/api: apply failed: boom".into(),
            },
        );
        summary.recount();

        let lines = result_lines(&summary);
        assert_eq!(
            lines,
            vec![
                "RESULT\tfailed\t(planned=2 succeeded=1 failed=1 blocked=0)".to_string(),
                "c/ns/db\tsucceeded\t1".to_string(),
                "c/ns/api\tfailed\t2\tc/ns/api: apply failed: boom".to_string(),
            ]
        );
    }

    #[test]
    fn test_event_lines() {
        let failed = RunEvent::new("r1", "c/ns/api", EventType::NodeFailed)
            .with_attempt(1)
            .with_error(RunError::new("APPLY_FAILED", "boom"));
        assert_eq!(event_line(&failed).as_deref(), Some("c/ns/api failed: boom"));

        let blocked = RunEvent::new("r1", "c/ns/web", EventType::NodeBlocked)
            .with_fields(Fields::new().set("reason", "dependency c/ns/api failed"));
        assert_eq!(
            event_line(&blocked).as_deref(),
            Some("c/ns/web blocked: dependency c/ns/api failed")
        );

        let queued = RunEvent::new("r1", "c/ns/web", EventType::NodeQueued);
        assert_eq!(event_line(&queued), None);
    }

    #[test]
    fn test_output_format_resolution() {
        assert_eq!(OutputFormat::resolve(None, Some("json")), OutputFormat::Json);
        assert_eq!(
            OutputFormat::resolve(Some(OutputFormat::Table), Some("json")),
            OutputFormat::Table
        );
        assert_eq!(OutputFormat::resolve(None, None), OutputFormat::Table);
    }

    #[test]
    fn test_table_pads_all_but_last_column() {
        let out = table(
            &["ID", "STATUS"],
            &[vec!["c/ns/db".into(), "ok".into()]],
        );
        assert_eq!(out, "ID       STATUS\nc/ns/db  ok");
    }
}
