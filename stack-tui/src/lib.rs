mod app;
mod events;
mod ui;

pub use app::{format_duration, App, AppState, NodeProgress, RunProgress};

use color_eyre::Result;
use stack_service::execution::EventReceiver;
use tokio_util::sync::CancellationToken;

/// Render a live run until the user quits after RUN_COMPLETED
///
/// `events` is the receiving half of `event_channel()`; the observer half
/// goes to the coordinator. Cancelling from the dashboard fires `cancel`.
pub async fn run_dashboard(
    title: impl Into<String>,
    events: EventReceiver,
    cancel: CancellationToken,
) -> Result<()> {
    let terminal = ratatui::init();
    let result = App::new(title.into(), events, cancel).run(terminal).await;
    ratatui::restore();
    result
}
