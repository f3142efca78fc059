//! Info panel: tabbed Schema and Resources view for the current result.

use std::collections::BTreeMap;

use ratatui::buffer::Buffer;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::prelude::Stylize;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{
    Block, Borders, Padding, Paragraph, Row, StatefulWidget, Table, TableState, Tabs, Widget,
};

use super::datatable::type_label;
use crate::fetcher::FetchStats;
use crate::ingest::{IngestMetrics, IngestState};
use crate::store::ColumnarStore;

/// Human-readable byte size (e.g. "1.2 MiB", "456 KiB").
pub fn format_bytes(n: u64) -> String {
    const K: u64 = 1024;
    const M: u64 = K * K;
    const G: u64 = M * K;
    if n >= G {
        format!("{:.1} GiB", n as f64 / G as f64)
    } else if n >= M {
        format!("{:.1} MiB", n as f64 / M as f64)
    } else if n >= K {
        format!("{:.1} KiB", n as f64 / K as f64)
    } else {
        format!("{} B", n)
    }
}

fn format_int(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            out.insert(0, ',');
        }
        out.insert(0, c);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfoTab {
    #[default]
    Schema,
    Resources,
}

impl InfoTab {
    pub fn toggle(self) -> Self {
        match self {
            InfoTab::Schema => InfoTab::Resources,
            InfoTab::Resources => InfoTab::Schema,
        }
    }

    fn index(self) -> usize {
        match self {
            InfoTab::Schema => 0,
            InfoTab::Resources => 1,
        }
    }
}

#[derive(Default)]
pub struct InfoModal {
    pub active: bool,
    pub active_tab: InfoTab,
    pub schema_selected_index: usize,
    pub schema_scroll_offset: usize,
    pub schema_table_state: TableState,
    /// Data rows that fit in the schema table, set during render.
    pub schema_visible_height: usize,
}

impl InfoModal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self) {
        self.active = true;
        self.active_tab = InfoTab::Schema;
        self.schema_selected_index = 0;
        self.schema_scroll_offset = 0;
        self.schema_table_state.select(Some(0));
    }

    pub fn close(&mut self) {
        self.active = false;
    }

    pub fn switch_tab(&mut self) {
        self.active_tab = self.active_tab.toggle();
    }

    /// Returns true if the selection moved.
    pub fn schema_table_down(&mut self, total_rows: usize) -> bool {
        if total_rows == 0 || self.schema_selected_index + 1 >= total_rows {
            return false;
        }
        self.schema_selected_index += 1;
        let visible = self.schema_visible_height;
        if visible > 0 && self.schema_selected_index >= self.schema_scroll_offset + visible {
            self.schema_scroll_offset = self.schema_selected_index + 1 - visible;
        }
        self.sync_selection();
        true
    }

    pub fn schema_table_up(&mut self) -> bool {
        if self.schema_selected_index == 0 {
            return false;
        }
        self.schema_selected_index -= 1;
        if self.schema_selected_index < self.schema_scroll_offset {
            self.schema_scroll_offset = self.schema_selected_index;
        }
        self.sync_selection();
        true
    }

    fn sync_selection(&mut self) {
        let local = self
            .schema_selected_index
            .saturating_sub(self.schema_scroll_offset);
        self.schema_table_state.select(Some(local));
    }

    fn clamp(&mut self, total_rows: usize) {
        if total_rows == 0 {
            self.schema_table_state.select(None);
            return;
        }
        self.schema_selected_index = self.schema_selected_index.min(total_rows - 1);
        self.schema_scroll_offset = self.schema_scroll_offset.min(self.schema_selected_index);
        self.sync_selection();
    }
}

/// Numbers shown on the Resources tab.
#[derive(Debug, Clone, Default)]
pub struct InfoContext {
    /// Human description of the running query, e.g. "question 42 (stream)".
    pub source: String,
    pub fetch_stats: Option<FetchStats>,
    pub ingest: Option<(IngestState, IngestMetrics)>,
}

pub struct ResultInfo<'a> {
    store: &'a ColumnarStore,
    ctx: &'a InfoContext,
    modal: &'a mut InfoModal,
    border_color: Color,
    active_color: Color,
}

impl<'a> ResultInfo<'a> {
    pub fn new(
        store: &'a ColumnarStore,
        ctx: &'a InfoContext,
        modal: &'a mut InfoModal,
        border_color: Color,
        active_color: Color,
    ) -> Self {
        Self {
            store,
            ctx,
            modal,
            border_color,
            active_color,
        }
    }

    fn render_schema_tab(&mut self, area: Rect, buf: &mut Buffer) {
        let summary = format!(
            "Rows: {} · Columns: {}",
            format_int(self.store.row_count() as u64),
            self.store.column_count()
        );
        let mut lines = vec![summary];
        let by_type = columns_by_type(self.store);
        if !by_type.is_empty() {
            lines.push(by_type);
        }
        for (i, s) in lines.iter().enumerate() {
            if i as u16 >= area.height {
                return;
            }
            Paragraph::new(s.as_str()).render(
                Rect {
                    y: area.y + i as u16,
                    height: 1,
                    ..area
                },
                buf,
            );
        }
        let used = lines.len() as u16;
        let rest = Rect {
            y: area.y + used,
            height: area.height.saturating_sub(used),
            ..area
        };
        if rest.height > 0 {
            self.render_schema_table(rest, buf);
        }
    }

    fn render_schema_table(&mut self, area: Rect, buf: &mut Buffer) {
        let block = Block::default()
            .title(Line::from("Schema").bold())
            .padding(Padding::new(1, 1, 1, 0))
            .border_style(Style::default().fg(self.border_color));
        let inner = block.inner(area);
        block.render(area, buf);

        let columns = self.store.columns();
        self.modal.schema_visible_height = (inner.height as usize).saturating_sub(1);
        self.modal.clamp(columns.len());

        let offset = self.modal.schema_scroll_offset;
        let rows: Vec<Row> = columns
            .iter()
            .skip(offset)
            .take(self.modal.schema_visible_height)
            .map(|c| {
                Row::new(vec![
                    c.name.clone(),
                    c.display_name.clone(),
                    type_label(c.column_type).to_string(),
                ])
            })
            .collect();
        let table = Table::new(
            rows,
            [
                Constraint::Percentage(40),
                Constraint::Percentage(40),
                Constraint::Percentage(20),
            ],
        )
        .header(Row::new(vec!["Column", "Label", "Type"]).bold())
        .column_spacing(1)
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol(">> ");
        StatefulWidget::render(table, inner, buf, &mut self.modal.schema_table_state);
    }

    fn resource_lines(&self) -> Vec<(&'static str, String)> {
        let mut lines = vec![
            ("Source:", self.ctx.source.clone()),
            ("Rows:", format_int(self.store.row_count() as u64)),
            ("Columns:", self.store.column_count().to_string()),
            (
                "Memory (est.):",
                format_bytes(self.store.estimated_size_bytes() as u64),
            ),
        ];
        if let Some(stats) = &self.ctx.fetch_stats {
            lines.push(("Requests:", format_int(stats.network_requests)));
            lines.push((
                "Cache:",
                format!(
                    "{} entries · {} hits · {} misses",
                    stats.cache.entries, stats.cache.hits, stats.cache.misses
                ),
            ));
        }
        if let Some((state, metrics)) = &self.ctx.ingest {
            lines.push(("Stream:", state.label().to_string()));
            lines.push(("Chunks:", format_int(metrics.chunks_received)));
            lines.push((
                "Throughput:",
                format!("{:.0} rows/s", metrics.rows_per_second()),
            ));
            let first = metrics
                .time_to_first_chunk
                .map(|d| format!("{} ms", d.as_millis()))
                .unwrap_or_else(|| "-".to_string());
            lines.push(("First chunk:", first));
        }
        lines
    }

    fn render_resources_tab(&self, area: Rect, buf: &mut Buffer) {
        const LABEL_WIDTH: u16 = 16;
        for (i, (label, value)) in self.resource_lines().into_iter().enumerate() {
            if i as u16 >= area.height {
                break;
            }
            let row = Rect {
                y: area.y + i as u16,
                height: 1,
                ..area
            };
            let chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Length(LABEL_WIDTH), Constraint::Min(1)])
                .split(row);
            Paragraph::new(label).render(chunks[0], buf);
            Paragraph::new(value).render(chunks[1], buf);
        }
    }
}

fn columns_by_type(store: &ColumnarStore) -> String {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for column in store.columns() {
        *counts.entry(type_label(column.column_type)).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join(" · ")
}

impl Widget for &mut ResultInfo<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let block = Block::default().borders(Borders::ALL).title("Info");
        let inner = block.inner(area);
        block.render(area, buf);

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(2), Constraint::Min(4)])
            .split(inner);

        Tabs::new(vec!["Schema", "Resources"])
            .style(Style::default().fg(self.border_color))
            .highlight_style(
                Style::default()
                    .fg(self.active_color)
                    .add_modifier(Modifier::REVERSED),
            )
            .select(self.modal.active_tab.index())
            .render(chunks[0], buf);

        match self.modal.active_tab {
            InfoTab::Schema => self.render_schema_tab(chunks[1], buf),
            InfoTab::Resources => self.render_resources_tab(chunks[1], buf),
        }
    }
}
