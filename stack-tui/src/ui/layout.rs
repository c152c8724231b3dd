use ratatui::layout::{Constraint, Direction, Layout, Rect};

/// Dashboard: header, progress gauge, releases beside events, footer
pub fn create_run_layout(area: Rect) -> Vec<Rect> {
    Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(1),
            Constraint::Length(3),
        ])
        .split(area)
        .to_vec()
}

/// Log view: header, optional release detail strip, log, footer
///
/// The detail slot has zero height when the log is not narrowed to a release.
pub fn create_log_layout(area: Rect, with_detail: bool) -> Vec<Rect> {
    let detail = if with_detail { 4 } else { 0 };
    Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(detail),
            Constraint::Min(1),
            Constraint::Length(3),
        ])
        .split(area)
        .to_vec()
}
