use ratatui::{
    buffer::Buffer,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style, Stylize},
    widgets::{Paragraph, Widget},
};

const CONTROLS: [(&str, &str); 7] = [
    ("r", "Reload"),
    ("s", "Stop"),
    ("e", "Export"),
    ("c", "Clear cache"),
    ("i", "Info"),
    ("?", "Help"),
    ("q", "Quit"),
];

/// Bottom bar: key hints, row count and the current session status.
#[derive(Default)]
pub struct Controls {
    pub row_count: Option<usize>,
    /// Short status such as "Streaming 4 chunks" or "Exported 3 rows".
    pub status: Option<String>,
    pub dimmed: bool,
    /// Highlights "Stop" while a stream can be stopped.
    pub streaming: bool,
    pub background: Option<Color>,
}

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row_count(row_count: usize) -> Self {
        Self {
            row_count: Some(row_count),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: Option<String>) -> Self {
        self.status = status;
        self
    }

    pub fn with_background(mut self, color: Color) -> Self {
        self.background = Some(color);
        self
    }

    pub fn with_dimmed(mut self, dimmed: bool) -> Self {
        self.dimmed = dimmed;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

impl Widget for &Controls {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let mut constraints = CONTROLS.iter().fold(vec![], |mut acc, (key, action)| {
            acc.push(Constraint::Length(key.chars().count() as u16 + 2));
            acc.push(Constraint::Length(action.chars().count() as u16 + 1));
            acc
        });
        if self.row_count.is_some() {
            constraints.push(Constraint::Length(15));
        }
        constraints.push(Constraint::Fill(1));

        let layout = Layout::new(Direction::Horizontal, constraints).split(area);
        let bg = self.background.unwrap_or(Color::DarkGray);
        let base_style = if self.dimmed {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default()
        };

        for (i, (key, action)) in CONTROLS.iter().enumerate() {
            let j = i * 2;
            Paragraph::new(*key)
                .style(base_style.bold())
                .centered()
                .render(layout[j], buf);
            let action_style = if *action == "Stop" && self.streaming {
                base_style.bg(bg).fg(Color::Cyan)
            } else {
                base_style.bg(bg)
            };
            Paragraph::new(*action)
                .style(action_style)
                .render(layout[j + 1], buf);
        }

        let mut fill = CONTROLS.len() * 2;
        if let Some(count) = self.row_count {
            Paragraph::new(format!("Rows: {}", count))
                .style(base_style.bg(bg).fg(if self.dimmed {
                    Color::DarkGray
                } else {
                    Color::White
                }))
                .right_aligned()
                .render(layout[fill], buf);
            fill += 1;
        }

        Paragraph::new(format!(" {}", self.status.as_deref().unwrap_or("")))
            .style(base_style.bg(bg))
            .render(layout[fill], buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(buf: &Buffer, width: u16) -> String {
        (0..width).map(|x| buf[(x, 0)].symbol().to_string()).collect()
    }

    #[test]
    fn test_renders_keys_rows_and_status() {
        let controls = Controls::with_row_count(1234).with_status(Some("Streaming".into()));
        let area = Rect::new(0, 0, 140, 1);
        let mut buf = Buffer::empty(area);
        (&controls).render(area, &mut buf);
        let text = line(&buf, 140);
        assert!(text.contains("Reload"));
        assert!(text.contains("Clear cache"));
        assert!(text.contains("Rows: 1234"));
        assert!(text.contains("Streaming"));
    }
}
