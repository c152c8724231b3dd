use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

use crate::app::OutputKind;
use stack_service::state::NodeStatus;

pub fn render_header(title: &str, frame: &mut Frame, area: Rect) {
    let header = Paragraph::new(title)
        .style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(header, area);
}

pub fn render_footer(text: &str, frame: &mut Frame, area: Rect) {
    let footer = Paragraph::new(text)
        .style(Style::default().fg(Color::Gray))
        .block(Block::default().borders(Borders::ALL).title("Help"));
    frame.render_widget(footer, area);
}

pub fn node_status_display(status: NodeStatus) -> (&'static str, Color) {
    match status {
        NodeStatus::Planned => (".", Color::DarkGray),
        NodeStatus::Queued => ("o", Color::Gray),
        NodeStatus::Running => ("~", Color::Cyan),
        NodeStatus::Succeeded => ("O", Color::Green),
        NodeStatus::Failed => ("X", Color::Red),
        NodeStatus::Blocked => ("-", Color::Yellow),
    }
}

pub fn output_style(kind: &OutputKind) -> Style {
    let color = match kind {
        OutputKind::Success => Color::Green,
        OutputKind::Failure | OutputKind::Error => Color::Red,
        OutputKind::Warning => Color::Yellow,
        OutputKind::NodeHeader => Color::Cyan,
        OutputKind::Info => Color::Gray,
        OutputKind::Output => Color::White,
    };
    let style = Style::default().fg(color);
    match kind {
        OutputKind::NodeHeader | OutputKind::Success | OutputKind::Failure => {
            style.add_modifier(Modifier::BOLD)
        }
        _ => style,
    }
}
