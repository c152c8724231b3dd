use crate::events::EventHandler;
use crate::ui;

use color_eyre::Result;
use ratatui::DefaultTerminal;

use std::collections::HashMap;
use std::time::Duration;

use stack_service::execution::{EventReceiver, EventType, RunEvent};
use stack_service::state::NodeStatus;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Application States
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppState {
    /// Node table, progress gauge and live output
    Dashboard,
    /// Scrollable, searchable event log
    RunLog,
}

// =============================================================================
// Application
// =============================================================================

pub struct App {
    pub state: AppState,
    pub title: String,
    pub should_quit: bool,
    pub selected_index: usize,
    pub run: RunProgress,
    pub log_viewer: LogViewerState,
    event_receiver: Option<EventReceiver>,
    cancel: CancellationToken,
}

// =============================================================================
// Run Progress
// =============================================================================

#[derive(Debug, Default)]
pub struct RunProgress {
    pub run_id: String,
    pub command: String,
    pub nodes: Vec<NodeProgress>,
    index: HashMap<String, usize>,
    pub output_lines: Vec<OutputLine>,
    pub concurrency: u64,
    pub is_complete: bool,
    /// Final run status once RUN_COMPLETED arrives
    pub status: String,
    pub cancel_requested: bool,
    started_ns: Option<i64>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct NodeProgress {
    pub id: String,
    pub cluster: String,
    pub namespace: String,
    pub name: String,
    pub status: NodeStatus,
    pub attempt: u32,
    /// Phase currently running, empty between phases
    pub phase: String,
    /// Last error or block reason
    pub message: String,
    started_ns: Option<i64>,
    pub duration: Option<Duration>,
}

impl NodeProgress {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            cluster: String::new(),
            namespace: String::new(),
            name: id.rsplit('/').next().unwrap_or(id).to_string(),
            status: NodeStatus::Planned,
            attempt: 0,
            phase: String::new(),
            message: String::new(),
            started_ns: None,
            duration: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked
        )
    }
}

#[derive(Debug, Clone)]
pub struct OutputLine {
    pub text: String,
    pub kind: OutputKind,
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputKind {
    Info,
    Output,
    Error,
    Success,
    Failure,
    Warning,
    NodeHeader,
}

fn elapsed(from: Option<i64>, to: i64) -> Option<Duration> {
    from.map(|start| Duration::from_nanos(to.saturating_sub(start).max(0) as u64))
}

impl RunProgress {
    fn node_mut(&mut self, id: &str) -> &mut NodeProgress {
        let idx = match self.index.get(id) {
            Some(idx) => *idx,
            None => {
                self.nodes.push(NodeProgress::new(id));
                self.index.insert(id.to_string(), self.nodes.len() - 1);
                self.nodes.len() - 1
            }
        };
        &mut self.nodes[idx]
    }

    fn push(&mut self, kind: OutputKind, node_id: &str, text: String) {
        self.output_lines.push(OutputLine {
            text,
            kind,
            node_id: (!node_id.is_empty()).then(|| node_id.to_string()),
        });
    }

    /// Fold one event into the view
    pub fn apply(&mut self, ev: &RunEvent) {
        let node_id = ev.node_id.as_str();
        match ev.event_type {
            EventType::RunStarted => {
                self.run_id = ev.run_id.clone();
                self.command = ev.field_str("command").unwrap_or_default().to_string();
                self.concurrency = ev.fields.get("concurrency").and_then(|v| v.as_u64()).unwrap_or(0);
                self.started_ns = Some(ev.ts_ns);
                self.push(
                    OutputKind::Info,
                    "",
                    format!("Run {} started: {}", ev.run_id, ev.message),
                );
            }

            EventType::RunCompleted => {
                self.is_complete = true;
                self.status = ev.field_str("status").unwrap_or(&ev.message).to_string();
                self.duration = elapsed(self.started_ns, ev.ts_ns);
                let kind = if self.status == "succeeded" {
                    OutputKind::Success
                } else {
                    OutputKind::Failure
                };
                let text = format!(
                    "Run {} after {}",
                    self.status,
                    format_duration(self.duration.unwrap_or_default())
                );
                self.push(kind, "", text);
            }

            EventType::RunConcurrency => {
                if let Some(to) = ev.fields.get("to").and_then(|v| v.as_u64()) {
                    self.concurrency = to;
                }
                self.push(OutputKind::Info, "", ev.message.clone());
            }

            EventType::NodeMeta => {
                let cluster = ev.field_str("cluster").unwrap_or_default().to_string();
                let namespace = ev.field_str("namespace").unwrap_or_default().to_string();
                let name = ev.field_str("name").map(str::to_string);
                let node = self.node_mut(node_id);
                node.cluster = cluster;
                node.namespace = namespace;
                if let Some(name) = name {
                    node.name = name;
                }
            }

            EventType::NodeQueued => {
                let node = self.node_mut(node_id);
                if !node.is_terminal() {
                    node.status = NodeStatus::Queued;
                }
            }

            EventType::NodeRunning => {
                let node = self.node_mut(node_id);
                node.status = NodeStatus::Running;
                node.attempt = ev.attempt;
                node.message.clear();
                node.started_ns = Some(ev.ts_ns);
                node.duration = None;
                self.push(
                    OutputKind::NodeHeader,
                    node_id,
                    format!("{} (attempt {})", node_id, ev.attempt),
                );
            }

            EventType::NodeSucceeded => {
                let node = self.node_mut(node_id);
                node.status = NodeStatus::Succeeded;
                node.phase.clear();
                node.duration = elapsed(node.started_ns, ev.ts_ns);
                self.push(OutputKind::Success, node_id, format!("{} succeeded", node_id));
            }

            EventType::NodeFailed => {
                let message = ev
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| ev.message.clone());
                let node = self.node_mut(node_id);
                node.status = NodeStatus::Failed;
                node.attempt = ev.attempt;
                node.phase.clear();
                node.message = message.clone();
                node.duration = elapsed(node.started_ns, ev.ts_ns);
                self.push(OutputKind::Failure, node_id, format!("{} failed: {}", node_id, message));
            }

            EventType::NodeBlocked => {
                let reason = ev.field_str("reason").unwrap_or(&ev.message).to_string();
                let node = self.node_mut(node_id);
                node.status = NodeStatus::Blocked;
                node.message = reason.clone();
                self.push(OutputKind::Warning, node_id, format!("{} blocked: {}", node_id, reason));
            }

            EventType::RetryScheduled => {
                // the node goes back to running once the backoff elapses
                let node = self.node_mut(node_id);
                node.status = NodeStatus::Queued;
                self.push(
                    OutputKind::Warning,
                    node_id,
                    format!("{}: {}", node_id, ev.message),
                );
            }

            EventType::PhaseStarted => {
                let phase = ev.field_str("phase").unwrap_or_default().to_string();
                if !node_id.is_empty() {
                    self.node_mut(node_id).phase = phase.clone();
                }
                self.push(OutputKind::Info, node_id, format!("  phase {} started", phase));
            }

            EventType::PhaseCompleted => {
                if !node_id.is_empty() {
                    self.node_mut(node_id).phase.clear();
                }
                let phase = ev.field_str("phase").unwrap_or_default();
                let status = ev.field_str("status").unwrap_or_default();
                let kind = if status == "failed" {
                    OutputKind::Error
                } else {
                    OutputKind::Info
                };
                let mut text = format!("  phase {} {}", phase, status);
                if !ev.message.is_empty() {
                    text.push_str(&format!(": {}", ev.message));
                }
                self.push(kind, node_id, text);
            }

            EventType::HookStarted | EventType::HookSucceeded | EventType::HookSkipped => {
                self.push(OutputKind::Info, node_id, format!("  {}", ev.message));
            }

            EventType::HookFailed => {
                self.push(OutputKind::Error, node_id, format!("  {}", ev.message));
            }

            EventType::BudgetWait => {
                self.push(OutputKind::Warning, node_id, format!("{}: {}", node_id, ev.message));
            }

            EventType::NodeLog | EventType::HelmLog => {
                self.push(OutputKind::Output, node_id, format!("    {}", ev.message));
            }
        }
    }

    /// The producer went away without RUN_COMPLETED
    fn detach(&mut self) {
        if !self.is_complete {
            self.is_complete = true;
            self.status = "aborted".to_string();
            self.push(OutputKind::Failure, "", "Run ended without completing".to_string());
        }
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Ratio of nodes in a terminal state (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        let done = self.nodes.iter().filter(|n| n.is_terminal()).count() as f64;
        done / self.nodes.len() as f64
    }

    pub fn succeeded(&self) -> bool {
        self.is_complete && self.status == "succeeded"
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let whole = d.as_secs();
        format!("{}m{:02}s", whole / 60, whole % 60)
    }
}

// =============================================================================
// Log Viewer State
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct LogViewerState {
    pub scroll_offset: usize,
    pub search_query: String,
    pub search_active: bool,
    pub search_matches: Vec<usize>,
    pub current_match: usize,
    pub filter_node: Option<String>,
}

impl LogViewerState {
    pub fn reset(&mut self) {
        self.scroll_offset = 0;
        self.search_query.clear();
        self.search_active = false;
        self.search_matches.clear();
        self.current_match = 0;
        self.filter_node = None;
    }
}

// =============================================================================
// App Implementation
// =============================================================================

impl App {
    pub fn new(title: String, events: EventReceiver, cancel: CancellationToken) -> Self {
        Self {
            state: AppState::Dashboard,
            title,
            should_quit: false,
            selected_index: 0,
            run: RunProgress::default(),
            log_viewer: LogViewerState::default(),
            event_receiver: Some(events),
            cancel,
        }
    }

    pub async fn run(&mut self, mut terminal: DefaultTerminal) -> Result<()> {
        while !self.should_quit {
            terminal.draw(|frame| ui::render(self, frame))?;
            self.handle_events()?;
            self.process_run_events();
        }
        Ok(())
    }

    /// Drain whatever the coordinator produced since the last frame
    pub fn process_run_events(&mut self) {
        let Some(rx) = &mut self.event_receiver else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(event) => self.run.apply(&event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.event_receiver = None;
                    self.run.detach();
                    break;
                }
            }
        }
        if self.state == AppState::RunLog && !self.log_viewer.search_query.is_empty() {
            self.update_search_matches();
        }
    }

    // =========================================================================
    // Navigation
    // =========================================================================

    pub fn move_up(&mut self) {
        match self.state {
            AppState::Dashboard => {
                self.selected_index = self.selected_index.saturating_sub(1);
            }
            AppState::RunLog => {
                self.log_viewer.scroll_offset = self.log_viewer.scroll_offset.saturating_sub(1);
            }
        }
    }

    pub fn move_down(&mut self) {
        match self.state {
            AppState::Dashboard => {
                if self.selected_index + 1 < self.run.nodes.len() {
                    self.selected_index += 1;
                }
            }
            AppState::RunLog => {
                let max = self.filtered_output_lines().len().saturating_sub(1);
                self.log_viewer.scroll_offset = (self.log_viewer.scroll_offset + 1).min(max);
            }
        }
    }

    pub fn page_up(&mut self) {
        self.log_viewer.scroll_offset = self.log_viewer.scroll_offset.saturating_sub(20);
    }

    pub fn page_down(&mut self) {
        let max = self.filtered_output_lines().len().saturating_sub(1);
        self.log_viewer.scroll_offset = (self.log_viewer.scroll_offset + 20).min(max);
    }

    pub fn scroll_top(&mut self) {
        self.log_viewer.scroll_offset = 0;
    }

    pub fn scroll_bottom(&mut self) {
        self.log_viewer.scroll_offset = self.filtered_output_lines().len().saturating_sub(1);
    }

    pub fn back_to_dashboard(&mut self) {
        self.state = AppState::Dashboard;
    }

    /// Quitting is only allowed once the run is over; use cancel first
    pub fn quit(&mut self) {
        if self.run.is_complete {
            self.should_quit = true;
        }
    }

    pub fn request_cancel(&mut self) {
        if !self.run.is_complete && !self.run.cancel_requested {
            self.run.cancel_requested = true;
            self.cancel.cancel();
            self.run.push(OutputKind::Warning, "", "Cancellation requested".to_string());
        }
    }

    // =========================================================================
    // Log Viewer
    // =========================================================================

    pub fn open_log_viewer(&mut self, node_only: bool) {
        self.log_viewer.reset();
        if node_only {
            self.log_viewer.filter_node = self.selected_node().map(|n| n.id.clone());
        }
        self.state = AppState::RunLog;
    }

    pub fn start_search(&mut self) {
        if self.state == AppState::RunLog {
            self.log_viewer.search_active = true;
            self.log_viewer.search_query.clear();
            self.log_viewer.search_matches.clear();
            self.log_viewer.current_match = 0;
        }
    }

    pub fn search_push_char(&mut self, c: char) {
        if self.log_viewer.search_active {
            self.log_viewer.search_query.push(c);
            self.update_search_matches();
        }
    }

    pub fn search_pop_char(&mut self) {
        if self.log_viewer.search_active {
            self.log_viewer.search_query.pop();
            self.update_search_matches();
        }
    }

    pub fn cancel_search(&mut self) {
        self.log_viewer.search_active = false;
        self.log_viewer.search_query.clear();
        self.log_viewer.search_matches.clear();
    }

    pub fn confirm_search(&mut self) {
        self.log_viewer.search_active = false;
        if let Some(line) = self.log_viewer.search_matches.get(self.log_viewer.current_match) {
            self.log_viewer.scroll_offset = *line;
        }
    }

    pub fn next_search_match(&mut self) {
        if !self.log_viewer.search_matches.is_empty() {
            self.log_viewer.current_match =
                (self.log_viewer.current_match + 1) % self.log_viewer.search_matches.len();
            self.log_viewer.scroll_offset =
                self.log_viewer.search_matches[self.log_viewer.current_match];
        }
    }

    fn update_search_matches(&mut self) {
        let query = self.log_viewer.search_query.to_lowercase();
        let matches: Vec<usize> = if query.is_empty() {
            Vec::new()
        } else {
            self.filtered_output_lines()
                .iter()
                .enumerate()
                .filter(|(_, line)| line.text.to_lowercase().contains(&query))
                .map(|(i, _)| i)
                .collect()
        };
        self.log_viewer.search_matches = matches;
        if self.log_viewer.current_match >= self.log_viewer.search_matches.len() {
            self.log_viewer.current_match = 0;
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub fn selected_node(&self) -> Option<&NodeProgress> {
        self.run.nodes.get(self.selected_index)
    }

    /// Output lines for the log viewer, narrowed to one node when filtered
    pub fn filtered_output_lines(&self) -> Vec<&OutputLine> {
        self.run
            .output_lines
            .iter()
            .filter(|line| match &self.log_viewer.filter_node {
                Some(filter) => line.node_id.as_deref() == Some(filter.as_str()),
                None => true,
            })
            .collect()
    }
}
