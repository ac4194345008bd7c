// appinapp-cli/src/ui.rs
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
};

use appinapp_core::{Geometry, ProcessRole, WindowContent, WindowLevel};

use crate::app::{App, Focus, Pane};

// Logical pixels per terminal cell.
const CELL_WIDTH: f64 = 8.0;
const CELL_HEIGHT: f64 = 16.0;

const SIDEBAR_WIDTH: u16 = 36;

pub fn draw(f: &mut Frame, app: &mut App) {
    let area = f.area();

    if matches!(app.role(), ProcessRole::WidgetHost(_)) {
        draw_desktop(f, app, area);
        return;
    }

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(10)])
        .split(area);
    let sidebar = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(40),
            Constraint::Percentage(40),
            Constraint::Length(6),
            Constraint::Length(3),
        ])
        .split(columns[0]);

    draw_types(f, app, sidebar[0]);
    draw_instances(f, app, sidebar[1]);
    draw_stats(f, app, sidebar[2]);
    draw_status(f, app, sidebar[3]);
    draw_desktop(f, app, columns[1]);
}

fn border(focused: bool) -> Style {
    let color = if focused {
        Color::Yellow
    } else {
        Color::DarkGray
    };
    Style::default().fg(color)
}

fn draw_types(f: &mut Frame, app: &App, area: Rect) {
    let focused = app.focus == Focus::Types;
    let block = Block::default()
        .title(" Widget types ")
        .borders(Borders::ALL)
        .border_style(border(focused));

    let types = app.types();
    if types.is_empty() {
        let message = match app.scan_error() {
            Some(e) => e,
            None => format!("No widgets in {}", app.widget_folder().display()),
        };
        let paragraph = Paragraph::new(message)
            .block(block)
            .style(Style::default().fg(Color::Gray))
            .wrap(Wrap { trim: true });
        f.render_widget(paragraph, area);
        return;
    }

    let items: Vec<ListItem> = types.iter().map(|t| ListItem::new(*t)).collect();
    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = ListState::default();
    if focused {
        state.select(Some(app.selected_type));
    }
    f.render_stateful_widget(list, area, &mut state);
}

fn draw_instances(f: &mut Frame, app: &App, area: Rect) {
    let focused = app.focus == Focus::Instances;
    let block = Block::default()
        .title(" Instances ")
        .borders(Borders::ALL)
        .border_style(border(focused));

    let items: Vec<ListItem> = app
        .instances()
        .iter()
        .map(|i| {
            let mut spans = vec![Span::from(i.widget_type.clone())];
            if i.background {
                spans.push(Span::styled(" [bg]", Style::default().fg(Color::Blue)));
            }
            if i.always_on_top {
                spans.push(Span::styled(" [top]", Style::default().fg(Color::Magenta)));
            }
            spans.push(Span::styled(
                format!(" {:.0}x{:.0}", i.width, i.height),
                Style::default().fg(Color::DarkGray),
            ));
            ListItem::new(Line::from(spans))
        })
        .collect();

    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED));
    let mut state = ListState::default();
    if !app.instances().is_empty() {
        state.select(Some(app.selected_instance));
    }
    f.render_stateful_widget(list, area, &mut state);
}

fn draw_stats(f: &mut Frame, app: &App, area: Rect) {
    let stats = app.stats();
    let total = stats.total();
    let lines = vec![
        Line::from(format!(
            "Main      {:>5.1}% {:>5} MiB",
            stats.main.cpu, stats.main.memory_mib
        )),
        Line::from(format!(
            "Renderer  {:>5.1}% {:>5} MiB",
            stats.renderer.cpu, stats.renderer.memory_mib
        )),
        Line::from(Span::styled(
            format!("Total     {:>5.1}% {:>5} MiB", total.cpu, total.memory_mib),
            Style::default().fg(Color::Cyan),
        )),
    ];
    let title = if app.hot_reload() {
        " Stats [live] "
    } else {
        " Stats "
    };
    let paragraph = Paragraph::new(Text::from(lines)).block(
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(border(false)),
    );
    f.render_widget(paragraph, area);
}

fn draw_status(f: &mut Frame, app: &App, area: Rect) {
    let (title, text) = match &app.folder_input {
        Some(input) => (" Widget folder (Enter/Esc) ", format!("{input}_")),
        None => (
            " q quit  Tab  Enter add  d del  w folder ",
            app.status.clone().unwrap_or_default(),
        ),
    };
    let paragraph = Paragraph::new(text).block(
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(border(app.folder_input.is_some())),
    );
    f.render_widget(paragraph, area);
}

fn draw_desktop(f: &mut Frame, app: &mut App, area: Rect) {
    let desktop = Block::default()
        .title(" Desktop ")
        .borders(Borders::ALL)
        .border_style(border(false));
    let inner = desktop.inner(area);
    f.render_widget(desktop, area);

    let full_screen = matches!(app.role(), ProcessRole::WidgetHost(_));
    for pane in app.panes() {
        let rect = if full_screen {
            Some(inner)
        } else {
            pane_rect(&pane.geometry, inner)
        };
        if let Some(rect) = rect {
            draw_pane(f, &pane, rect);
        }
    }
}

fn draw_pane(f: &mut Frame, pane: &Pane, area: Rect) {
    let color = if pane.selected {
        Color::Yellow
    } else {
        match pane.level {
            WindowLevel::Bottom => Color::Blue,
            WindowLevel::Normal => Color::Gray,
            WindowLevel::Top => Color::Magenta,
        }
    };
    let block = Block::default()
        .title(pane.title.as_str())
        .borders(Borders::ALL)
        .border_style(Style::default().fg(color));

    let (text, style) = match &pane.content {
        WindowContent::Empty => (String::new(), Style::default()),
        WindowContent::Loading => ("Loading…".to_string(), Style::default().fg(Color::Gray)),
        WindowContent::TypeNotFound {
            widget_type,
            folder,
        } => (
            format!(
                "Widget type '{widget_type}' not found in {}",
                folder.display()
            ),
            Style::default().fg(Color::Yellow),
        ),
        WindowContent::Crashed { message } => (
            format!("Widget crashed\n{message}"),
            Style::default().fg(Color::Red),
        ),
        WindowContent::Widget { node, .. } => (node.text_content(), Style::default()),
    };

    f.render_widget(Clear, area);
    let paragraph = Paragraph::new(text)
        .block(block)
        .style(style)
        .wrap(Wrap { trim: false });
    f.render_widget(paragraph, area);
}

/// Cells covered by a window on the desktop, clipped. None when off-screen.
fn pane_rect(geometry: &Geometry, desktop: Rect) -> Option<Rect> {
    let col = (geometry.x / CELL_WIDTH).round().max(0.0) as u16;
    let row = (geometry.y / CELL_HEIGHT).round().max(0.0) as u16;
    if col >= desktop.width || row >= desktop.height {
        return None;
    }
    let width = ((geometry.width / CELL_WIDTH).round() as u16).max(3);
    let height = ((geometry.height / CELL_HEIGHT).round() as u16).max(3);
    Some(Rect {
        x: desktop.x + col,
        y: desktop.y + row,
        width: width.min(desktop.width - col),
        height: height.min(desktop.height - row),
    })
}
