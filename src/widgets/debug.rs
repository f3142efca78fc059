use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::Line,
    widgets::{Paragraph, Widget},
};

use crate::logging::LogBuffer;

#[derive(Default)]
pub struct DebugState {
    pub num_events: usize,
    pub num_frames: usize,
    pub num_key_events: usize,
    pub last_key_event_name: String,
    pub last_type_name: String,
    /// Last action taken (e.g. "page_down") for debugging key handling.
    pub last_action: String,
    pub enabled: bool,
    /// Materialized rows and render passes, copied from the table before drawing.
    pub materialized_rows: usize,
    pub render_count: usize,
    pub log: Option<LogBuffer>,
    /// Log lines shown under the counters.
    pub log_tail: usize,
}

impl DebugState {
    pub fn on_key(&mut self, event: &crossterm::event::KeyEvent) {
        self.num_key_events += 1;
        self.last_key_event_name = format!("{:?}", event.code);
        self.last_type_name = format!("{:?}", event.kind);
    }

    /// Lines the panel needs: one for counters plus the log tail.
    pub fn height(&self) -> u16 {
        let logs = match &self.log {
            Some(log) => log.len().min(self.log_tail),
            None => 0,
        };
        1 + logs as u16
    }
}

impl Widget for &DebugState {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(1), Constraint::Fill(1)])
            .split(area);
        Paragraph::new(format!(
            "events={} keys={} last_key={} kind={} last_action={} frames={} rows={} renders={}",
            self.num_events,
            self.num_key_events,
            self.last_key_event_name,
            self.last_type_name,
            self.last_action,
            self.num_frames,
            self.materialized_rows,
            self.render_count,
        ))
        .render(chunks[0], buf);

        if let Some(log) = &self.log {
            let lines: Vec<Line> = log
                .tail(chunks[1].height as usize)
                .iter()
                .map(|l| Line::from(l.to_string()))
                .collect();
            Paragraph::new(lines)
                .style(Style::default().fg(Color::DarkGray))
                .render(chunks[1], buf);
        }
    }
}
