use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Wrap},
    Frame,
};

use crate::app::{format_duration, App, OutputLine};
use crate::ui::{components, layout};

use stack_service::state::NodeStatus;

pub fn render(app: &App, frame: &mut Frame) {
    let chunks = layout::create_run_layout(frame.area());
    let run = &app.run;

    let header = if run.run_id.is_empty() {
        app.title.clone()
    } else {
        format!("{} | {} | run {}", app.title, run.command, run.run_id)
    };
    components::render_header(&header, frame, chunks[0]);

    let label = if run.is_complete {
        format!(
            "{} in {}",
            run.status,
            run.duration.map(format_duration).unwrap_or_default()
        )
    } else {
        format!(
            "running={} succeeded={} failed={} blocked={} of {} | concurrency {}",
            run.count(NodeStatus::Running),
            run.count(NodeStatus::Succeeded),
            run.count(NodeStatus::Failed),
            run.count(NodeStatus::Blocked),
            run.nodes.len(),
            run.concurrency
        )
    };
    let gauge_color = if !run.is_complete {
        Color::Cyan
    } else if run.succeeded() {
        Color::Green
    } else {
        Color::Red
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(gauge_color))
        .label(label)
        .ratio(run.progress());
    frame.render_widget(gauge, chunks[1]);

    let main_sections = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(chunks[2]);

    render_node_panel(app, frame, main_sections[0]);
    render_output_panel(&run.output_lines, frame, main_sections[1]);

    let footer = if run.is_complete {
        "j/k: Select | Enter: Node log | l: Full log | q/Esc: Quit"
    } else if run.cancel_requested {
        "Cancelling, waiting for running releases..."
    } else {
        "j/k: Select | Enter: Node log | l: Full log | c/Ctrl-C: Cancel run"
    };
    components::render_footer(footer, frame, chunks[3]);
}

fn render_node_panel(app: &App, frame: &mut Frame, area: Rect) {
    let mut items: Vec<ListItem> = Vec::new();
    let mut last_cluster = "";

    for (i, node) in app.run.nodes.iter().enumerate() {
        if node.cluster != last_cluster {
            last_cluster = node.cluster.as_str();
            items.push(ListItem::new(Line::from(Span::styled(
                format!("cluster {}", node.cluster),
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ))));
        }

        let (symbol, color) = components::node_status_display(node.status);
        let selected = i == app.selected_index;
        let name_style = if selected {
            Style::default()
                .fg(Color::Black)
                .bg(Color::Cyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(color)
        };
        let mut detail = String::new();
        if !node.phase.is_empty() {
            detail.push_str(&format!(" [{}]", node.phase));
        }
        if node.attempt > 1 {
            detail.push_str(&format!(" #{}", node.attempt));
        }
        if let Some(d) = node.duration {
            detail.push_str(&format!(" ({})", format_duration(d)));
        }

        items.push(ListItem::new(Line::from(vec![
            Span::raw("  "),
            Span::styled(format!("{} ", symbol), Style::default().fg(color)),
            Span::styled(format!("{}/{}", node.namespace, node.name), name_style),
            Span::styled(detail, Style::default().fg(Color::DarkGray)),
        ])));

        if !node.message.is_empty() && matches!(node.status, NodeStatus::Failed | NodeStatus::Blocked) {
            items.push(ListItem::new(Line::from(vec![
                Span::raw("      "),
                Span::styled(node.message.as_str(), Style::default().fg(Color::DarkGray)),
            ])));
        }
    }

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("Releases ({})", app.run.nodes.len()))
            .border_style(Style::default().fg(Color::Cyan)),
    );
    frame.render_widget(list, area);
}

fn render_output_panel(lines: &[OutputLine], frame: &mut Frame, area: Rect) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let start = lines.len().saturating_sub(visible_height);

    let visible_lines: Vec<Line> = lines
        .iter()
        .skip(start)
        .map(|line| Line::from(Span::styled(&line.text, components::output_style(&line.kind))))
        .collect();

    let output = Paragraph::new(visible_lines)
        .block(Block::default().borders(Borders::ALL).title("Events"))
        .wrap(Wrap { trim: false });
    frame.render_widget(output, area);
}
