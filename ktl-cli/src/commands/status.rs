use crate::commands::StackContext;
use crate::output::{self, OutputFormat};

use clap::Args;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use stack_service::execution::RunEvent;
use stack_service::status::{DEFAULT_TAIL, FOLLOW_INTERVAL};
use stack_service::{follow_events, run_snapshot, StateStore};

/// Show a run's summary and recent events
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Run to show (defaults to the most recent)
    #[arg(long, default_value = "")]
    pub run_id: String,

    /// Number of trailing events to show
    #[arg(long, default_value_t = DEFAULT_TAIL)]
    pub limit: usize,

    /// Keep printing new events until the run completes
    #[arg(long, short = 'f')]
    pub follow: bool,
}

pub async fn execute(ctx: &StackContext, args: StatusArgs) -> Result<()> {
    let store = StateStore::open_read_only(&ctx.root)?;
    let snapshot = run_snapshot(&store, &args.run_id, args.limit)?;
    let format = OutputFormat::resolve(ctx.output, None);

    match format {
        OutputFormat::Json if !args.follow => return output::json(&snapshot),
        OutputFormat::Json => {
            for ev in &snapshot.events {
                println!("{}", ev.to_json_line());
            }
        }
        OutputFormat::Table => {
            output::header(&format!(
                "{} {} run {} ({})",
                snapshot.command,
                snapshot.stack_name,
                snapshot.run_id,
                snapshot.summary.status.as_str()
            ));
            for ev in &snapshot.events {
                print_stored(ev);
            }
        }
    }

    if args.follow && !snapshot.is_complete() {
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };
        follow_events(
            &store,
            &snapshot.run_id,
            snapshot.last_seq(),
            FOLLOW_INTERVAL,
            &cancel,
            |ev| match format {
                OutputFormat::Json => println!("{}", ev.to_json_line()),
                OutputFormat::Table => print_stored(ev),
            },
        )
        .await?;
        watcher.abort();
    }

    if format == OutputFormat::Table {
        // re-read so a followed run reports its final state
        let summary = store.get_run_summary(&snapshot.run_id)?;
        output::print_result(&summary);
    }
    Ok(())
}

fn print_stored(ev: &RunEvent) {
    if let Some(line) = output::event_line(ev) {
        output::dim(&format!("{:>6} {}", ev.seq, ev.ts()));
        println!("       {}", line);
    }
}
