//! Windowed row rendering.
//!
//! The [`Virtualizer`] keeps the number of materialized rows bounded by the
//! viewport plus a buffer, whatever the size of the store behind it. Offsets
//! and heights are in abstract pixels; the terminal front end uses one line
//! per `row_height` pixels.

use crate::format::{ColumnFormatters, FormatStrategy};
use crate::store::ColumnarStore;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_ROW_HEIGHT: u64 = 30;
pub const DEFAULT_BUFFER_ROWS: usize = 100;
pub const DEFAULT_RERENDER_THRESHOLD: usize = 20;
pub const DEFAULT_DIRECT_RENDER_LIMIT: usize = 1000;
pub const DEFAULT_SCROLL_THROTTLE: Duration = Duration::from_millis(16);

/// Half-open row range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisibleWindow {
    pub start: usize,
    pub end: usize,
}

impl VisibleWindow {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start.min(end),
            end,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains_window(&self, other: &VisibleWindow) -> bool {
        other.is_empty() || (other.start >= self.start && other.end <= self.end)
    }
}

/// Rows intersecting `[scroll_offset, scroll_offset + viewport_height)`, widened
/// by `buffer_rows` on both sides and clamped to `row_count`.
///
/// The partly visible row at the bottom edge is included, so an offset that is
/// not a multiple of `row_height` yields `ceil(viewport_height / row_height)
/// + 2 * buffer_rows + 1` rows away from the ends of the result.
pub fn compute_window(
    scroll_offset: u64,
    viewport_height: u64,
    row_height: u64,
    buffer_rows: usize,
    row_count: usize,
) -> VisibleWindow {
    let h = row_height.max(1);
    let first = usize::try_from(scroll_offset / h).unwrap_or(usize::MAX);
    let last = usize::try_from(scroll_offset.saturating_add(viewport_height).div_ceil(h))
        .unwrap_or(usize::MAX);
    let start = first.saturating_sub(buffer_rows);
    let end = last.saturating_add(buffer_rows).min(row_count);
    VisibleWindow::new(start, end)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// No rows: the surface shows an explicit empty state.
    Empty,
    /// Small result, every row materialized.
    Direct,
    Windowed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRow {
    pub index: usize,
    /// Absolute position inside the spacer, `index * row_height`.
    pub top: u64,
    pub cells: Vec<String>,
}

/// Destination of rendered rows. `render_rows` replaces whatever was shown
/// before, so rendering the same window twice leaves the same content.
pub trait RowSurface {
    fn show_empty(&mut self);
    fn render_rows(&mut self, rows: Vec<MaterializedRow>);
    fn set_spacer_height(&mut self, height: u64);
}

/// Surface that keeps materialized rows in memory. Used by the table widget
/// and by tests.
#[derive(Debug, Default, Clone)]
pub struct MemorySurface {
    rows: Vec<MaterializedRow>,
    spacer_height: u64,
    empty: bool,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[MaterializedRow] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn spacer_height(&self) -> u64 {
        self.spacer_height
    }

    pub fn is_showing_empty(&self) -> bool {
        self.empty
    }

    /// Materialized row for a store index, if it is currently rendered.
    pub fn row(&self, index: usize) -> Option<&MaterializedRow> {
        let first = self.rows.first()?.index;
        self.rows
            .get(index.checked_sub(first)?)
            .filter(|r| r.index == index)
    }
}

impl RowSurface for MemorySurface {
    fn show_empty(&mut self) {
        self.rows.clear();
        self.empty = true;
    }

    fn render_rows(&mut self, rows: Vec<MaterializedRow>) {
        self.rows = rows;
        self.empty = false;
    }

    fn set_spacer_height(&mut self, height: u64) {
        self.spacer_height = height;
    }
}

/// Trailing-edge throttle for scroll offsets. Offers inside one interval
/// collapse into a single recompute at the end of it, using the latest value.
#[derive(Debug, Clone)]
pub struct ScrollThrottle {
    interval: Duration,
    pending: Option<u64>,
    deadline: Option<Instant>,
}

impl ScrollThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            deadline: None,
        }
    }

    pub fn offer(&mut self, offset: u64, now: Instant) {
        self.pending = Some(offset);
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }

    /// Latest offered offset once the interval has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<u64> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.pending.take()
            }
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn clear(&mut self) {
        self.pending = None;
        self.deadline = None;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualizerOptions {
    pub row_height: u64,
    pub buffer_rows: usize,
    pub rerender_threshold: usize,
    pub direct_render_limit: usize,
    pub scroll_throttle: Duration,
}

impl Default for VirtualizerOptions {
    fn default() -> Self {
        Self {
            row_height: DEFAULT_ROW_HEIGHT,
            buffer_rows: DEFAULT_BUFFER_ROWS,
            rerender_threshold: DEFAULT_RERENDER_THRESHOLD,
            direct_render_limit: DEFAULT_DIRECT_RENDER_LIMIT,
            scroll_throttle: DEFAULT_SCROLL_THROTTLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rendered {
    mode: RenderMode,
    window: VisibleWindow,
    viewport_height: u64,
}

pub struct Virtualizer<S: RowSurface> {
    options: VirtualizerOptions,
    surface: S,
    strategy: Arc<dyn FormatStrategy>,
    formatters: Option<ColumnFormatters>,
    scroll_offset: u64,
    viewport_height: u64,
    throttle: ScrollThrottle,
    rendered: Option<Rendered>,
    spacer_height: Option<u64>,
    render_count: usize,
}

impl<S: RowSurface> Virtualizer<S> {
    pub fn new(surface: S, options: VirtualizerOptions, strategy: Arc<dyn FormatStrategy>) -> Self {
        let throttle = ScrollThrottle::new(options.scroll_throttle);
        Self {
            options,
            surface,
            strategy,
            formatters: None,
            scroll_offset: 0,
            viewport_height: 0,
            throttle,
            rendered: None,
            spacer_height: None,
            render_count: 0,
        }
    }

    pub fn options(&self) -> &VirtualizerOptions {
        &self.options
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn scroll_offset(&self) -> u64 {
        self.scroll_offset
    }

    pub fn viewport_height(&self) -> u64 {
        self.viewport_height
    }

    /// Offset the view will have once a pending throttled scroll is applied.
    pub fn target_offset(&self) -> u64 {
        self.throttle.pending.unwrap_or(self.scroll_offset)
    }

    /// Index of the row at the top edge of the viewport.
    pub fn first_visible_row(&self) -> usize {
        usize::try_from(self.scroll_offset / self.options.row_height.max(1)).unwrap_or(usize::MAX)
    }

    /// Whole rows that fit in the viewport.
    pub fn rows_per_page(&self) -> usize {
        usize::try_from(self.viewport_height / self.options.row_height.max(1)).unwrap_or(0)
    }

    pub fn rendered_window(&self) -> Option<VisibleWindow> {
        self.rendered.map(|r| r.window)
    }

    pub fn mode(&self) -> Option<RenderMode> {
        self.rendered.map(|r| r.mode)
    }

    /// Number of times rows were pushed to the surface.
    pub fn render_count(&self) -> usize {
        self.render_count
    }

    pub fn formatters(&self) -> Option<&ColumnFormatters> {
        self.formatters.as_ref()
    }

    /// Upper bound on materialized rows for the current viewport.
    pub fn capacity(&self) -> usize {
        let h = self.options.row_height.max(1);
        usize::try_from(self.viewport_height.div_ceil(h)).unwrap_or(usize::MAX)
            + 2 * self.options.buffer_rows
    }

    pub fn max_scroll_offset(&self, row_count: usize) -> u64 {
        (row_count as u64)
            .saturating_mul(self.options.row_height)
            .saturating_sub(self.viewport_height)
    }

    /// Forget everything rendered for the previous store. The next refresh
    /// resolves formatters again and renders from the top.
    pub fn reset(&mut self) {
        self.formatters = None;
        self.rendered = None;
        self.spacer_height = None;
        self.scroll_offset = 0;
        self.throttle.clear();
    }

    pub fn set_strategy(&mut self, strategy: Arc<dyn FormatStrategy>) {
        self.strategy = strategy;
        self.formatters = None;
        self.rendered = None;
    }

    pub fn set_viewport_height(&mut self, height: u64, store: &ColumnarStore) -> bool {
        if height == self.viewport_height {
            return false;
        }
        self.viewport_height = height;
        self.scroll_offset = self.scroll_offset.min(self.max_scroll_offset(store.row_count()));
        self.refresh(store)
    }

    /// Queue a scroll offset; applied by [`Virtualizer::tick`] at the end of
    /// the throttle interval.
    pub fn on_scroll(&mut self, offset: u64, now: Instant) {
        self.throttle.offer(offset, now);
    }

    /// Scroll by whole rows relative to the latest requested position.
    pub fn scroll_by_rows(&mut self, rows: i64, store: &ColumnarStore, now: Instant) {
        let base = self.target_offset();
        let delta = rows.unsigned_abs().saturating_mul(self.options.row_height);
        let target = if rows < 0 {
            base.saturating_sub(delta)
        } else {
            base.saturating_add(delta)
        };
        self.on_scroll(target.min(self.max_scroll_offset(store.row_count())), now);
    }

    pub fn throttle_deadline(&self) -> Option<Instant> {
        self.throttle.deadline()
    }

    /// Apply a throttled scroll if one is due. Returns true when the surface
    /// changed.
    pub fn tick(&mut self, store: &ColumnarStore, now: Instant) -> bool {
        match self.throttle.poll(now) {
            Some(offset) => self.apply_scroll(offset, store),
            None => false,
        }
    }

    /// Immediate scroll, bypassing the throttle.
    pub fn scroll_to(&mut self, offset: u64, store: &ColumnarStore) -> bool {
        self.throttle.clear();
        self.apply_scroll(offset, store)
    }

    fn apply_scroll(&mut self, offset: u64, store: &ColumnarStore) -> bool {
        self.scroll_offset = offset.min(self.max_scroll_offset(store.row_count()));
        self.refresh(store)
    }

    /// The store grew. The scroll position is left where it is; only the
    /// spacer and, when needed, the window change.
    pub fn on_rows_appended(&mut self, store: &ColumnarStore) -> bool {
        self.refresh(store)
    }

    fn mode_for(&self, row_count: usize) -> RenderMode {
        if row_count == 0 {
            RenderMode::Empty
        } else if row_count <= self.options.direct_render_limit && row_count <= self.capacity() {
            RenderMode::Direct
        } else {
            RenderMode::Windowed
        }
    }

    fn target_window(&self, mode: RenderMode, row_count: usize) -> VisibleWindow {
        match mode {
            RenderMode::Empty => VisibleWindow::default(),
            RenderMode::Direct => VisibleWindow::new(0, row_count),
            RenderMode::Windowed => compute_window(
                self.scroll_offset,
                self.viewport_height,
                self.options.row_height,
                self.options.buffer_rows,
                row_count,
            ),
        }
    }

    fn needs_render(&self, mode: RenderMode, window: VisibleWindow, row_count: usize) -> bool {
        let Some(prev) = self.rendered else {
            return true;
        };
        if prev.mode != mode || prev.viewport_height != self.viewport_height {
            return true;
        }
        match mode {
            RenderMode::Empty => false,
            RenderMode::Direct => prev.window != window,
            RenderMode::Windowed => {
                let threshold = self.options.rerender_threshold;
                let band = compute_window(
                    self.scroll_offset,
                    self.viewport_height,
                    self.options.row_height,
                    0,
                    row_count,
                );
                prev.window.start.abs_diff(window.start) >= threshold
                    || prev.window.end.abs_diff(window.end) >= threshold
                    || !prev.window.contains_window(&band)
            }
        }
    }

    /// Recompute the window for the current offset and row count, rendering
    /// only when it moved past the threshold or the visible band is no longer
    /// covered.
    pub fn refresh(&mut self, store: &ColumnarStore) -> bool {
        let row_count = store.row_count();
        let spacer = (row_count as u64).saturating_mul(self.options.row_height);
        if self.spacer_height != Some(spacer) {
            self.surface.set_spacer_height(spacer);
            self.spacer_height = Some(spacer);
        }

        if self.formatters.is_none() && store.is_initialized() {
            self.formatters = Some(ColumnFormatters::resolve(
                store.columns(),
                self.strategy.as_ref(),
            ));
        }

        let mode = self.mode_for(row_count);
        let window = self.target_window(mode, row_count);
        if !self.needs_render(mode, window, row_count) {
            return false;
        }

        if mode == RenderMode::Empty {
            self.surface.show_empty();
        } else {
            self.render_window(store, window);
        }
        self.rendered = Some(Rendered {
            mode,
            window,
            viewport_height: self.viewport_height,
        });
        self.render_count += 1;
        true
    }

    /// Materialize exactly `window` onto the surface.
    pub fn render_window(&mut self, store: &ColumnarStore, window: VisibleWindow) {
        let h = self.options.row_height;
        let rows = store
            .rows(window.start..window.end)
            .iter()
            .enumerate()
            .map(|(offset, row)| {
                let index = window.start + offset;
                let cells = match &self.formatters {
                    Some(f) => f.format_row(row),
                    None => row.iter().map(|c| c.to_string()).collect(),
                };
                MaterializedRow {
                    index,
                    top: index as u64 * h,
                    cells,
                }
            })
            .collect();
        self.surface.render_rows(rows);
    }
}

impl<S: RowSurface + std::fmt::Debug> std::fmt::Debug for Virtualizer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Virtualizer")
            .field("options", &self.options)
            .field("surface", &self.surface)
            .field("scroll_offset", &self.scroll_offset)
            .field("viewport_height", &self.viewport_height)
            .field("rendered", &self.rendered)
            .finish()
    }
}
