use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};

use crate::app::{format_duration, App, LogViewerState, NodeProgress};
use crate::ui::{components, layout};

pub fn render(app: &App, frame: &mut Frame) {
    let node = app
        .log_viewer
        .filter_node
        .as_deref()
        .and_then(|id| app.run.nodes.iter().find(|n| n.id == id));
    let chunks = layout::create_log_layout(frame.area(), node.is_some());

    let header = match node {
        Some(n) => format!("Log | {}", n.id),
        None => format!("Log | run {}", app.run.run_id),
    };
    components::render_header(&header, frame, chunks[0]);

    if let Some(node) = node {
        render_node_detail(node, frame, chunks[1]);
    }
    render_log_panel(app, frame, chunks[2]);

    let footer = if app.log_viewer.search_active {
        "Type to search | Enter: Confirm | Esc: Cancel"
    } else {
        "j/k: Scroll | PgUp/PgDn: Page | g/G: Top/Bottom | /: Search | n: Next | q/Esc: Dashboard"
    };
    components::render_footer(footer, frame, chunks[3]);
}

fn render_node_detail(node: &NodeProgress, frame: &mut Frame, area: Rect) {
    let (symbol, color) = components::node_status_display(node.status);
    let mut status = vec![
        Span::styled(
            format!("{} {}", symbol, node.status.as_str()),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!("  attempt {}", node.attempt),
            Style::default().fg(Color::Gray),
        ),
    ];
    if let Some(d) = node.duration {
        status.push(Span::styled(
            format!("  {}", format_duration(d)),
            Style::default().fg(Color::DarkGray),
        ));
    }
    if !node.phase.is_empty() {
        status.push(Span::styled(
            format!("  phase {}", node.phase),
            Style::default().fg(Color::Cyan),
        ));
    }
    let reason = if node.message.is_empty() {
        Line::from(Span::styled(
            format!("{} / {}", node.cluster, node.namespace),
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        Line::from(Span::styled(node.message.as_str(), Style::default().fg(Color::Red)))
    };

    let detail = Paragraph::new(vec![Line::from(status), reason])
        .block(Block::default().borders(Borders::ALL).title(node.name.as_str()))
        .wrap(Wrap { trim: true });
    frame.render_widget(detail, area);
}

fn render_log_panel(app: &App, frame: &mut Frame, area: Rect) {
    let lines = app.filtered_output_lines();
    let viewer = &app.log_viewer;

    if lines.is_empty() {
        let empty = Paragraph::new("Nothing logged yet.")
            .style(Style::default().fg(Color::DarkGray))
            .block(Block::default().borders(Borders::ALL).title("Events"));
        frame.render_widget(empty, area);
        return;
    }

    let height = area.height.saturating_sub(2) as usize;
    let offset = viewer.scroll_offset.min(lines.len().saturating_sub(height));
    let visible: Vec<Line> = lines
        .iter()
        .enumerate()
        .skip(offset)
        .take(height)
        .map(|(idx, line)| {
            let mut style = components::output_style(&line.kind);
            if viewer.search_matches.contains(&idx) {
                style = style.bg(Color::DarkGray);
            }
            Line::from(Span::styled(line.text.as_str(), style))
        })
        .collect();

    let border = if viewer.search_active {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default().fg(Color::Cyan)
    };
    let log = Paragraph::new(visible)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(log_title(viewer, offset, lines.len()))
                .border_style(border),
        )
        .wrap(Wrap { trim: false });
    frame.render_widget(log, area);
}

fn log_title(viewer: &LogViewerState, offset: usize, total: usize) -> String {
    if viewer.search_active {
        format!("Events [/{}_]", viewer.search_query)
    } else if viewer.search_query.is_empty() {
        format!("Events [{}/{}]", offset + 1, total)
    } else if viewer.search_matches.is_empty() {
        format!("Events [no match for '{}']", viewer.search_query)
    } else {
        format!(
            "Events [match {}/{} for '{}']",
            viewer.current_match + 1,
            viewer.search_matches.len(),
            viewer.search_query
        )
    }
}
