use std::sync::Arc;
use std::time::Instant;

use ratatui::{
    buffer::Buffer,
    layout::{Margin, Rect},
    style::{Color, Modifier, Style},
    text::Line,
    widgets::{
        Block, Borders, Cell, Padding, Paragraph, Row, Scrollbar, ScrollbarOrientation,
        ScrollbarState, StatefulWidget, Table, TableState, Widget,
    },
};

use crate::format::FormatStrategy;
use crate::store::{ColumnarStore, ColumnType};
use crate::virtualizer::{MemorySurface, RenderMode, Virtualizer, VirtualizerOptions};

/// Terminal view over a [`Virtualizer`]. One terminal line is one row of
/// `row_height` virtual pixels.
pub struct DataTableState {
    pub virtualizer: Virtualizer<MemorySurface>,
    pub table_state: TableState,
    /// Absolute index of the selected row.
    pub selected: usize,
    /// First scrollable column shown.
    pub termcol_index: usize,
    headers: Vec<String>,
    right_aligned: Vec<bool>,
    visible_lines: usize,
    row_numbers: bool,
}

impl DataTableState {
    pub fn new(options: VirtualizerOptions, strategy: Arc<dyn FormatStrategy>) -> Self {
        Self {
            virtualizer: Virtualizer::new(MemorySurface::new(), options, strategy),
            table_state: TableState::default(),
            selected: 0,
            termcol_index: 0,
            headers: Vec::new(),
            right_aligned: Vec::new(),
            visible_lines: 0,
            row_numbers: false,
        }
    }

    pub fn set_row_numbers(&mut self, enabled: bool) {
        self.row_numbers = enabled;
    }

    pub fn toggle_row_numbers(&mut self) {
        self.row_numbers = !self.row_numbers;
    }

    /// Forget the previous result; the next sync starts from the top.
    pub fn reset(&mut self) {
        self.virtualizer.reset();
        self.headers.clear();
        self.right_aligned.clear();
        self.selected = 0;
        self.termcol_index = 0;
        self.table_state.select(None);
    }

    fn sync_headers(&mut self, store: &ColumnarStore) {
        if self.headers.len() != store.column_count() {
            self.headers = store
                .columns()
                .iter()
                .map(|c| c.display_name.clone())
                .collect();
            self.right_aligned = store
                .columns()
                .iter()
                .map(|c| c.column_type.is_numeric())
                .collect();
        }
    }

    /// Match the virtualizer viewport to the table area. Returns true when
    /// rows were rendered again.
    pub fn sync_viewport(&mut self, lines: usize, store: &ColumnarStore) -> bool {
        self.sync_headers(store);
        self.visible_lines = lines;
        let row_height = self.virtualizer.options().row_height;
        let changed = self
            .virtualizer
            .set_viewport_height(lines as u64 * row_height, store);
        changed || self.virtualizer.refresh(store)
    }

    /// New rows arrived. Scroll position and selection stay where they are.
    pub fn on_rows_appended(&mut self, store: &ColumnarStore) -> bool {
        self.sync_headers(store);
        self.virtualizer.on_rows_appended(store)
    }

    pub fn tick(&mut self, store: &ColumnarStore, now: Instant) -> bool {
        self.virtualizer.tick(store, now)
    }

    pub fn visible_lines(&self) -> usize {
        self.visible_lines
    }

    fn first_visible(&self) -> usize {
        self.virtualizer.first_visible_row()
    }

    /// Keep the selection inside the viewport by scrolling toward it.
    fn follow_selection(&mut self, now: Instant) {
        let h = self.virtualizer.options().row_height.max(1);
        let first = (self.virtualizer.target_offset() / h) as usize;
        let lines = self.visible_lines.max(1);
        if self.selected < first {
            self.virtualizer.on_scroll(self.selected as u64 * h, now);
        } else if self.selected >= first + lines {
            self.virtualizer
                .on_scroll((self.selected + 1 - lines) as u64 * h, now);
        }
    }

    fn move_selection(&mut self, delta: i64, store: &ColumnarStore, now: Instant) {
        let last = store.row_count().saturating_sub(1);
        self.selected = if delta < 0 {
            self.selected.saturating_sub(delta.unsigned_abs() as usize)
        } else {
            (self.selected + delta as usize).min(last)
        };
        self.follow_selection(now);
    }

    pub fn select_next(&mut self, store: &ColumnarStore, now: Instant) {
        self.move_selection(1, store, now);
    }

    pub fn select_previous(&mut self, store: &ColumnarStore, now: Instant) {
        self.move_selection(-1, store, now);
    }

    pub fn page_down(&mut self, store: &ColumnarStore, now: Instant) {
        let page = self.visible_lines.max(1) as i64;
        self.virtualizer.scroll_by_rows(page, store, now);
        self.move_selection(page, store, now);
    }

    pub fn page_up(&mut self, store: &ColumnarStore, now: Instant) {
        let page = self.visible_lines.max(1) as i64;
        self.virtualizer.scroll_by_rows(-page, store, now);
        self.move_selection(-page, store, now);
    }

    /// Mouse wheel: moves the view, the selection follows only if it would
    /// leave the screen.
    pub fn wheel(&mut self, rows: i64, store: &ColumnarStore, now: Instant) {
        self.virtualizer.scroll_by_rows(rows, store, now);
    }

    pub fn scroll_to_start(&mut self, store: &ColumnarStore) -> bool {
        self.selected = 0;
        self.virtualizer.scroll_to(0, store)
    }

    pub fn scroll_to_end(&mut self, store: &ColumnarStore) -> bool {
        self.selected = store.row_count().saturating_sub(1);
        let max = self.virtualizer.max_scroll_offset(store.row_count());
        self.virtualizer.scroll_to(max, store)
    }

    pub fn scroll_right(&mut self) {
        if self.termcol_index + 1 < self.headers.len() {
            self.termcol_index += 1;
        }
    }

    pub fn scroll_left(&mut self) {
        self.termcol_index = self.termcol_index.saturating_sub(1);
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

pub struct DataTable {
    pub header_bg: Color,
    pub header_fg: Color,
    pub row_numbers_fg: Color,
    pub dimmed_fg: Color,
    pub table_cell_padding: u16,
    pub alternate_row_bg: Option<Color>,
}

impl Default for DataTable {
    fn default() -> Self {
        Self {
            header_bg: Color::Indexed(236),
            header_fg: Color::White,
            row_numbers_fg: Color::DarkGray,
            dimmed_fg: Color::DarkGray,
            table_cell_padding: 1,
            alternate_row_bg: None,
        }
    }
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_colors(
        mut self,
        header_bg: Color,
        header_fg: Color,
        row_numbers_fg: Color,
        dimmed_fg: Color,
    ) -> Self {
        self.header_bg = header_bg;
        self.header_fg = header_fg;
        self.row_numbers_fg = row_numbers_fg;
        self.dimmed_fg = dimmed_fg;
        self
    }

    pub fn with_alternate_row_bg(mut self, color: Option<Color>) -> Self {
        self.alternate_row_bg = color;
        self
    }

    fn header_style(&self) -> Style {
        if self.header_bg == Color::Reset {
            Style::default().fg(self.header_fg)
        } else {
            Style::default().bg(self.header_bg).fg(self.header_fg)
        }
    }

    fn render_empty(&self, area: Rect, buf: &mut Buffer, waiting: bool) {
        let message = if waiting {
            "Waiting for rows..."
        } else {
            "No rows returned."
        };
        Paragraph::new(message)
            .centered()
            .style(Style::default().fg(self.dimmed_fg))
            .block(
                Block::default()
                    .borders(Borders::NONE)
                    .padding(Padding::top(area.height / 2)),
            )
            .render(area, buf);
    }
}

impl StatefulWidget for DataTable {
    type State = DataTableState;

    fn render(self, area: Rect, buf: &mut Buffer, state: &mut Self::State) {
        if area.height < 2 || area.width == 0 {
            return;
        }
        let surface = state.virtualizer.surface();
        if state.virtualizer.mode() == Some(RenderMode::Empty) || state.headers.is_empty() {
            self.render_empty(area, buf, state.headers.is_empty());
            return;
        }

        let lines = (area.height - 1) as usize;
        let first = state.first_visible();
        let total = surface.spacer_height() / state.virtualizer.options().row_height.max(1);
        let total = total as usize;
        let shown: Vec<(usize, &[String])> = (first..(first + lines).min(total))
            .map(|i| {
                let cells = surface.row(i).map(|r| r.cells.as_slice()).unwrap_or(&[]);
                (i, cells)
            })
            .collect();

        let table_area = Rect {
            width: area.width.saturating_sub(1),
            ..area
        };

        // widths: header or widest visible cell, columns added until the area is full
        let row_num_width = if state.row_numbers {
            (first + lines).to_string().len() as u16
        } else {
            0
        };
        let mut used = if state.row_numbers {
            row_num_width + self.table_cell_padding
        } else {
            0
        };
        let start_col = state.termcol_index.min(state.headers.len().saturating_sub(1));
        let mut columns: Vec<(usize, u16)> = Vec::new();
        for col in start_col..state.headers.len() {
            let widest = shown
                .iter()
                .filter_map(|(_, cells)| cells.get(col))
                .map(|c| c.chars().count())
                .max()
                .unwrap_or(0)
                .max(state.headers[col].chars().count()) as u16;
            let remaining = table_area.width.saturating_sub(used);
            if remaining == 0 {
                break;
            }
            if widest > remaining {
                // last column is truncated rather than dropped
                columns.push((col, remaining));
                break;
            }
            columns.push((col, widest));
            used += widest + self.table_cell_padding;
        }

        let mut widths: Vec<u16> = Vec::with_capacity(columns.len() + 1);
        if state.row_numbers {
            widths.push(row_num_width);
        }
        widths.extend(columns.iter().map(|(_, w)| *w));

        let mut header_cells: Vec<Cell> = Vec::with_capacity(widths.len());
        if state.row_numbers {
            header_cells.push(Cell::from(""));
        }
        header_cells.extend(
            columns
                .iter()
                .map(|(col, _)| Cell::from(state.headers[*col].as_str())),
        );

        let rows: Vec<Row> = shown
            .iter()
            .enumerate()
            .map(|(line, (index, cells))| {
                let mut row_cells: Vec<Cell> = Vec::with_capacity(widths.len());
                if state.row_numbers {
                    row_cells.push(
                        Cell::from(Line::from((index + 1).to_string()).right_aligned())
                            .style(Style::default().fg(self.row_numbers_fg)),
                    );
                }
                for (col, _) in &columns {
                    let text = cells.get(*col).map(String::as_str).unwrap_or("");
                    let line = if state.right_aligned.get(*col).copied().unwrap_or(false) {
                        Line::from(text).right_aligned()
                    } else {
                        Line::from(text)
                    };
                    row_cells.push(Cell::from(line));
                }
                let style = match self.alternate_row_bg {
                    Some(bg) if line % 2 == 1 => Style::default().bg(bg),
                    _ => Style::default(),
                };
                Row::new(row_cells).style(style)
            })
            .collect();

        let selected_line = state
            .selected
            .checked_sub(first)
            .filter(|l| *l < shown.len());
        state.table_state.select(selected_line);

        StatefulWidget::render(
            Table::new(rows, widths)
                .column_spacing(self.table_cell_padding)
                .header(Row::new(header_cells).style(self.header_style()))
                .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED)),
            table_area,
            buf,
            &mut state.table_state,
        );

        let mut scrollbar = ScrollbarState::new(total.saturating_sub(lines)).position(first);
        Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .begin_symbol(None)
            .end_symbol(None)
            .render(
                area.inner(Margin {
                    vertical: 1,
                    horizontal: 0,
                }),
                buf,
                &mut scrollbar,
            );
    }
}

/// Short type tag shown in the info panel.
pub fn type_label(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "int",
        ColumnType::Float => "float",
        ColumnType::Text => "text",
        ColumnType::Date => "date",
        ColumnType::DateTime => "datetime",
        ColumnType::Boolean => "bool",
    }
}
