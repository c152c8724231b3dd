pub mod components;
pub mod dashboard;
pub mod layout;
pub mod log_viewer;

use ratatui::Frame;

use crate::app::{App, AppState};

pub fn render(app: &App, frame: &mut Frame) {
    match app.state {
        AppState::Dashboard => dashboard::render(app, frame),
        AppState::RunLog => log_viewer::render(app, frame),
    }
}
