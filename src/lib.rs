use color_eyre::eyre::eyre;
use color_eyre::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseEvent, MouseEventKind};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Style};
use ratatui::{buffer::Buffer, layout::Rect, widgets::Widget};

use ratatui::widgets::{Block, Borders, Clear, Gauge, Paragraph, StatefulWidget, Wrap};

pub mod cache;
pub mod config;
pub mod error;
pub mod error_display;
pub mod export;
pub mod fetcher;
pub mod format;
pub mod ingest;
pub mod logging;
pub mod request;
pub mod response;
pub mod sse;
pub mod store;
pub mod virtualizer;
pub mod widgets;

pub use config::{AppConfig, ColorParser, ConfigManager, Theme};
pub use error::{ExportError, FetchError, IngestError, StoreError, TransientNetworkError};
pub use export::{
    export_csv, export_csv_string, export_file_name, export_json_string, ChunkedExport,
    CsvExport, ExportOptions, ExportProgress, FileExport, JsonExport, JsonMetadata, LineEnding,
};
pub use fetcher::{
    DataFetcher, FetchOptions, FetchStats, HttpRequest, HttpResponse, QueryTransport,
    ReqwestTransport,
};
pub use format::{FormatStrategy, LocaleFormat, NumberLocale, PlainFormat};
pub use ingest::{
    ChunkInfo, IngestMetrics, IngestObserver, IngestState, IngestSummary, StreamIngester,
    StreamOptions,
};
pub use request::{QueryRequest, QuestionId};
pub use rowscope_cli::{Args, CompressionFormat, ExportFormat};
pub use sse::{SseConnector, StreamConnector, StreamTransport, TransportPoll};
pub use store::{CellValue, Column, ColumnType, ColumnarStore, Row};
pub use virtualizer::{
    compute_window, MemorySurface, RenderMode, RowSurface, Virtualizer, VirtualizerOptions,
    VisibleWindow,
};

use error_display::{user_message_from_export, user_message_from_fetch, user_message_from_ingest};
use widgets::controls::Controls;
use widgets::datatable::{DataTable, DataTableState};
use widgets::debug::DebugState;
use widgets::info::{InfoContext, InfoModal, ResultInfo};

pub const APP_NAME: &str = "rowscope";

/// Everything a query session needs, resolved from the config file and the
/// command line.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub request: Option<QueryRequest>,
    pub stream: bool,
    pub fetch: FetchOptions,
    pub stream_options: StreamOptions,
    pub virtualizer: VirtualizerOptions,
    pub row_numbers: bool,
    pub display_format: LocaleFormat,
    pub export: ExportOptions,
    pub export_dir: PathBuf,
    pub export_format: ExportFormat,
    pub compression: Option<CompressionFormat>,
    pub use_display_format: bool,
    pub event_poll_interval: Duration,
}

impl SessionOptions {
    /// CLI arguments take precedence over the config file.
    pub fn from_args_and_config(args: &Args, config: &AppConfig) -> Result<Self> {
        let question = args
            .question
            .clone()
            .or_else(|| config.source.question_id.clone());
        let request = match question {
            Some(q) => {
                let id = q.parse::<QuestionId>().map_err(|e| eyre!("{:?}", e))?;
                Some(
                    QueryRequest::new(id)
                        .with_filter_args(&args.filters)
                        .map_err(|e| eyre!(e))?,
                )
            }
            None if !args.filters.is_empty() => {
                return Err(eyre!("--filter given without a question id"));
            }
            None => None,
        };

        let base_url = args
            .base_url
            .clone()
            .unwrap_or_else(|| config.source.base_url.clone());

        let fetch = FetchOptions {
            base_url: base_url.clone(),
            query_path: config.source.query_path.clone(),
            max_retries: args.retries.unwrap_or(config.fetch.max_retries),
            base_delay: Duration::from_millis(config.fetch.base_delay_ms),
            timeout: Duration::from_secs(args.timeout_secs.unwrap_or(config.fetch.timeout_secs)),
            cache_capacity: config.fetch.cache_capacity,
            cache_ttl: Duration::from_secs(config.fetch.cache_ttl_secs),
        };

        let stream_options = StreamOptions {
            base_url,
            stream_path: config.source.stream_path.clone(),
            chunk_size: Some(args.chunk_size.unwrap_or(config.stream.chunk_size)),
            max_events_per_pump: config.stream.max_events_per_tick,
        };

        let virtualizer = VirtualizerOptions {
            row_height: config.display.row_height,
            buffer_rows: args.buffer_rows.unwrap_or(config.display.buffer_rows),
            rerender_threshold: config.display.rerender_threshold,
            direct_render_limit: config.display.direct_render_limit,
            scroll_throttle: Duration::from_millis(config.display.scroll_throttle_ms),
        };

        let display_format = LocaleFormat {
            locale: config.display.locale(),
            date_format: config.display.date_format.clone(),
            datetime_format: config.display.datetime_format.clone(),
            ..LocaleFormat::default()
        };

        let export = ExportOptions {
            delimiter: args.delimiter.unwrap_or(config.export.delimiter),
            include_header: true,
            line_ending: config.export.line_ending,
            byte_order_mark: args.bom || config.export.byte_order_mark,
            chunk_size: config.export.chunk_size,
            include_metadata: args.json_metadata || config.export.include_metadata,
        };
        let export_format = match args.export_format {
            Some(format) => format,
            None => config.export.export_format()?,
        };

        let compression = match args.compression {
            Some(c) => Some(c),
            None => config.export.compression_format()?,
        };

        Ok(Self {
            request,
            stream: args.stream || config.stream.enabled,
            fetch,
            stream_options,
            virtualizer,
            row_numbers: args.row_numbers || config.display.row_numbers,
            display_format,
            export,
            export_dir: args
                .export_dir
                .clone()
                .or_else(|| config.export.directory.clone())
                .unwrap_or_else(|| PathBuf::from(".")),
            export_format,
            compression,
            use_display_format: config.export.use_display_format,
            event_poll_interval: Duration::from_millis(config.performance.event_poll_interval_ms),
        })
    }

    pub fn display_strategy(&self) -> Arc<dyn FormatStrategy> {
        Arc::new(self.display_format.clone())
    }

    /// Raw values unless the config asks for display formatting.
    pub fn export_strategy(&self) -> Arc<dyn FormatStrategy> {
        if self.use_display_format {
            self.display_strategy()
        } else {
            Arc::new(PlainFormat)
        }
    }

    /// Destination for an export in `format` started today.
    pub fn export_path(&self, format: ExportFormat) -> PathBuf {
        let today = chrono::Local::now().date_naive();
        self.export_dir
            .join(export_file_name(today, format, self.compression))
    }

    /// Open a file export of `store`. `query` is recorded in JSON metadata
    /// when that is enabled.
    pub fn open_export(
        &self,
        store: &ColumnarStore,
        format: ExportFormat,
        query: Option<&QueryRequest>,
    ) -> std::result::Result<FileExport, ExportError> {
        let export: ChunkedExport = match format {
            ExportFormat::Csv => {
                let strategy = self.export_strategy();
                CsvExport::new(store, self.export.clone(), strategy.as_ref())?.into()
            }
            ExportFormat::Json => {
                let metadata = self
                    .export
                    .include_metadata
                    .then(|| JsonMetadata::new(chrono::Utc::now(), query.cloned()));
                JsonExport::new(store, self.export.chunk_size, metadata)?.into()
            }
        };
        FileExport::create(export, self.export_path(format), self.compression)
    }
}

pub enum AppEvent {
    Key(KeyEvent),
    Mouse(MouseEvent),
    Load(QueryRequest),
    DoLoad(QueryRequest), // Internal event to start the query after the loading state is drawn
    FetchDone {
        generation: u64,
        result: Result<Arc<ColumnarStore>, FetchError>,
    },
    StreamChunk {
        generation: u64,
        rows: std::ops::Range<usize>,
        metrics: IngestMetrics,
    },
    StreamComplete {
        generation: u64,
        summary: IngestSummary,
    },
    StreamFailed {
        generation: u64,
        error: IngestError,
        metrics: IngestMetrics,
    },
    Exit,
    Crash(String),
    Resize(u16, u16), // resized (width, height)
}

/// Forwards ingestion callbacks to the event loop, tagged with the session
/// they belong to.
pub struct ChannelObserver {
    events: Sender<AppEvent>,
    generation: u64,
}

impl ChannelObserver {
    pub fn new(events: Sender<AppEvent>, generation: u64) -> Self {
        Self { events, generation }
    }
}

impl IngestObserver for ChannelObserver {
    fn on_chunk(&mut self, _store: &ColumnarStore, chunk: &ChunkInfo, metrics: &IngestMetrics) {
        let _ = self.events.send(AppEvent::StreamChunk {
            generation: self.generation,
            rows: chunk.rows.clone(),
            metrics: *metrics,
        });
    }

    fn on_complete(&mut self, _store: &ColumnarStore, summary: &IngestSummary) {
        let _ = self.events.send(AppEvent::StreamComplete {
            generation: self.generation,
            summary: summary.clone(),
        });
    }

    fn on_error(&mut self, error: &IngestError, metrics: &IngestMetrics) {
        let _ = self.events.send(AppEvent::StreamFailed {
            generation: self.generation,
            error: error.clone(),
            metrics: *metrics,
        });
    }
}

#[derive(Default)]
pub struct ErrorModal {
    pub active: bool,
    pub message: String,
}

impl ErrorModal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn show(&mut self, message: String) {
        self.active = true;
        self.message = message;
    }

    pub fn hide(&mut self) {
        self.active = false;
        self.message.clear();
    }
}

#[derive(Clone, Debug, Default)]
pub enum LoadingState {
    #[default]
    Idle,
    Loading {
        current_phase: String,
        progress_percent: u16,
    },
}

impl LoadingState {
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadingState::Loading { .. })
    }
}

/// Where the rows on screen come from.
enum Source {
    Idle,
    Fetch(Option<Arc<ColumnarStore>>),
    Stream,
}

fn current_store<'a, C: StreamConnector>(
    source: &'a Source,
    ingester: &'a StreamIngester<C>,
) -> Option<&'a ColumnarStore> {
    match source {
        Source::Fetch(Some(store)) => Some(store.as_ref()),
        Source::Stream => Some(ingester.store()),
        _ => None,
    }
}

const HELP_TEXT: &str = "\
Navigation
  j / Down        next row
  k / Up          previous row
  PageDown        next page
  PageUp          previous page
  Home / g        first row
  End / G         last row
  h / Left        scroll columns left
  l / Right       scroll columns right
  mouse wheel     three rows

Session
  r               run the question again
  s               stop streaming (rows received so far are kept)
  e               export the current rows (CSV unless configured otherwise)
  J               export the current rows to JSON
  c               clear the fetch cache
  n               toggle row numbers
  i               schema and resource info
  ?               this help
  q               quit";

pub struct App<T: QueryTransport = ReqwestTransport, C: StreamConnector = SseConnector> {
    events: Sender<AppEvent>,
    runtime: tokio::runtime::Handle,
    fetcher: Arc<DataFetcher<T>>,
    ingester: StreamIngester<C>,
    options: SessionOptions,
    source: Source,
    request: Option<QueryRequest>,
    generation: u64,
    pub table: DataTableState,
    export: Option<FileExport>,
    debug: DebugState,
    info: InfoModal,
    error_modal: ErrorModal,
    loading_state: LoadingState,
    show_help: bool,
    help_scroll: usize,
    status: Option<String>,
    theme: Theme,
}

impl App {
    /// App talking to the query service over HTTP.
    pub fn new(
        events: Sender<AppEvent>,
        runtime: tokio::runtime::Handle,
        options: SessionOptions,
        theme: Theme,
    ) -> Result<App> {
        let timeout = options.fetch.timeout;
        let fetcher = DataFetcher::new(ReqwestTransport::new(), options.fetch.clone());
        let connector = SseConnector::new(runtime.clone(), timeout, timeout)?;
        let ingester = StreamIngester::new(connector, options.stream_options.clone());
        Ok(App::with_parts(events, runtime, fetcher, ingester, options, theme))
    }
}

impl<T: QueryTransport, C: StreamConnector> App<T, C> {
    pub fn with_parts(
        events: Sender<AppEvent>,
        runtime: tokio::runtime::Handle,
        fetcher: DataFetcher<T>,
        ingester: StreamIngester<C>,
        options: SessionOptions,
        theme: Theme,
    ) -> Self {
        let mut table = DataTableState::new(options.virtualizer.clone(), options.display_strategy());
        table.set_row_numbers(options.row_numbers);
        Self {
            events,
            runtime,
            fetcher: Arc::new(fetcher),
            ingester,
            source: Source::Idle,
            request: options.request.clone(),
            options,
            generation: 0,
            table,
            export: None,
            debug: DebugState::default(),
            info: InfoModal::new(),
            error_modal: ErrorModal::new(),
            loading_state: LoadingState::Idle,
            show_help: false,
            help_scroll: 0,
            status: None,
            theme,
        }
    }

    pub fn send_event(&mut self, event: AppEvent) -> Result<()> {
        self.events.send(event)?;
        Ok(())
    }

    pub fn enable_debug(&mut self, log: Option<logging::LogBuffer>, log_tail: usize) {
        self.debug.enabled = true;
        self.debug.log = log;
        self.debug.log_tail = log_tail;
    }

    fn color(&self, name: &str) -> Color {
        self.theme.get(name)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn store(&self) -> Option<&ColumnarStore> {
        current_store(&self.source, &self.ingester)
    }

    pub fn stream_state(&self) -> IngestState {
        self.ingester.state()
    }

    pub fn is_loading(&self) -> bool {
        self.loading_state.is_loading()
    }

    pub fn is_exporting(&self) -> bool {
        self.export.is_some()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_modal
            .active
            .then_some(self.error_modal.message.as_str())
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn fetch_stats(&self) -> FetchStats {
        self.fetcher.stats()
    }

    pub fn event(&mut self, event: &AppEvent) -> Option<AppEvent> {
        self.debug.num_events += 1;
        match event {
            AppEvent::Key(key) => self.key(key),
            AppEvent::Mouse(mouse) => {
                self.mouse(mouse);
                None
            }
            AppEvent::Load(request) => {
                self.loading_state = LoadingState::Loading {
                    current_phase: format!("Running question {}", request.question_id),
                    progress_percent: 0,
                };
                Some(AppEvent::DoLoad(request.clone()))
            }
            AppEvent::DoLoad(request) => {
                self.start_session(request.clone());
                None
            }
            AppEvent::FetchDone { generation, result } => {
                if *generation == self.generation {
                    self.on_fetch_done(result.clone());
                }
                None
            }
            AppEvent::StreamChunk {
                generation,
                metrics,
                ..
            } => {
                if *generation == self.generation {
                    self.loading_state = LoadingState::Idle;
                    self.table.on_rows_appended(self.ingester.store());
                    self.status = Some(format!(
                        "Streaming: {} chunks, {:.0} rows/s",
                        metrics.chunks_received,
                        metrics.rows_per_second()
                    ));
                }
                None
            }
            AppEvent::StreamComplete {
                generation,
                summary,
            } => {
                if *generation == self.generation {
                    self.loading_state = LoadingState::Idle;
                    self.table.on_rows_appended(self.ingester.store());
                    self.status = Some(format!(
                        "{} rows in {:.1}s",
                        summary.total_rows,
                        summary.elapsed.as_secs_f64()
                    ));
                }
                None
            }
            AppEvent::StreamFailed {
                generation,
                error,
                metrics,
            } => {
                if *generation == self.generation {
                    self.loading_state = LoadingState::Idle;
                    self.table.on_rows_appended(self.ingester.store());
                    self.status = Some(format!("Stream failed after {} rows", metrics.rows_received));
                    self.error_modal.show(user_message_from_ingest(error));
                }
                None
            }
            AppEvent::Resize(_, _) => None,
            AppEvent::Exit | AppEvent::Crash(_) => None,
        }
    }

    /// Start a new session. Whatever was running before is abandoned.
    fn start_session(&mut self, request: QueryRequest) {
        self.generation += 1;
        self.ingester.stop();
        if self.export.take().is_some() {
            self.status = Some("Export cancelled".to_string());
        }
        self.table.reset();
        self.error_modal.hide();
        self.request = Some(request.clone());

        if self.options.stream {
            self.source = Source::Stream;
            self.loading_state = LoadingState::Loading {
                current_phase: "Connecting".to_string(),
                progress_percent: 0,
            };
            let observer = ChannelObserver::new(self.events.clone(), self.generation);
            self.ingester.start(&request, Box::new(observer));
        } else {
            self.source = Source::Fetch(None);
            let fetcher = Arc::clone(&self.fetcher);
            let events = self.events.clone();
            let generation = self.generation;
            self.runtime.spawn(async move {
                let result = fetcher.fetch(&request).await;
                let _ = events.send(AppEvent::FetchDone { generation, result });
            });
        }
    }

    fn on_fetch_done(&mut self, result: Result<Arc<ColumnarStore>, FetchError>) {
        self.loading_state = LoadingState::Idle;
        match result {
            Ok(store) => {
                self.status = Some(format!("{} rows", store.row_count()));
                self.source = Source::Fetch(Some(store));
            }
            Err(e) if e.is_cancelled() => {
                debug!("dropping cancelled fetch result");
            }
            Err(e) => {
                self.status = None;
                self.error_modal.show(user_message_from_fetch(&e));
            }
        }
    }

    /// Periodic work between input events: stream pumping, deferred scroll
    /// recomputation and export batches. Returns true when a redraw is needed.
    pub fn tick(&mut self, now: Instant) -> bool {
        let mut updated = false;
        if matches!(self.source, Source::Stream) && self.ingester.state().is_active() {
            updated |= self.ingester.pump(None) > 0;
        }
        if let Some(store) = current_store(&self.source, &self.ingester) {
            updated |= self.table.tick(store, now);
        }
        updated |= self.step_export();
        updated
    }

    fn step_export(&mut self) -> bool {
        let Some(export) = self.export.as_mut() else {
            return false;
        };
        let Some(store) = current_store(&self.source, &self.ingester) else {
            self.export = None;
            return true;
        };
        match export.step(store) {
            Ok(ExportProgress::Writing { .. }) => {}
            Ok(ExportProgress::Finished { path, rows }) => {
                info!("exported {} rows to {}", rows, path.display());
                self.status = Some(format!("Exported {} rows to {}", rows, path.display()));
                self.export = None;
            }
            Err(e) => {
                warn!("export failed: {}", e);
                self.export = None;
                self.status = None;
                self.error_modal.show(user_message_from_export(&e));
            }
        }
        true
    }

    fn start_export(&mut self, format: ExportFormat) {
        if self.export.is_some() {
            return;
        }
        let Some(store) = current_store(&self.source, &self.ingester) else {
            self.error_modal
                .show(user_message_from_export(&ExportError::NoSchema));
            return;
        };
        match self
            .options
            .open_export(store, format, self.request.as_ref())
        {
            Ok(export) => {
                info!(
                    "exporting {} rows as {} to {}",
                    export.total_rows(),
                    export.format().extension(),
                    export.destination().display()
                );
                self.status = Some("Exporting".to_string());
                self.export = Some(export);
            }
            Err(e) => self.error_modal.show(user_message_from_export(&e)),
        }
    }

    fn mouse(&mut self, mouse: &MouseEvent) {
        let Some(store) = current_store(&self.source, &self.ingester) else {
            return;
        };
        let now = Instant::now();
        match mouse.kind {
            MouseEventKind::ScrollDown => self.table.wheel(3, store, now),
            MouseEventKind::ScrollUp => self.table.wheel(-3, store, now),
            _ => {}
        }
    }

    fn key(&mut self, event: &KeyEvent) -> Option<AppEvent> {
        if event.kind != KeyEventKind::Press {
            return None;
        }
        self.debug.on_key(event);

        if self.error_modal.active {
            if matches!(event.code, KeyCode::Esc | KeyCode::Enter) {
                self.error_modal.hide();
            }
            return None;
        }

        if self.show_help {
            match event.code {
                KeyCode::Esc | KeyCode::Char('?') | KeyCode::Char('q') => {
                    self.show_help = false;
                    self.help_scroll = 0;
                }
                KeyCode::Char('j') | KeyCode::Down => self.help_scroll += 1,
                KeyCode::Char('k') | KeyCode::Up => {
                    self.help_scroll = self.help_scroll.saturating_sub(1)
                }
                _ => {}
            }
            return None;
        }

        if self.info.active {
            let columns = self.store().map(|s| s.column_count()).unwrap_or(0);
            match event.code {
                KeyCode::Esc | KeyCode::Char('i') => self.info.close(),
                KeyCode::Tab | KeyCode::BackTab => self.info.switch_tab(),
                KeyCode::Char('j') | KeyCode::Down => {
                    self.info.schema_table_down(columns);
                }
                KeyCode::Char('k') | KeyCode::Up => {
                    self.info.schema_table_up();
                }
                KeyCode::Char('q') => return Some(AppEvent::Exit),
                _ => {}
            }
            return None;
        }

        match event.code {
            KeyCode::Char('q') => return Some(AppEvent::Exit),
            KeyCode::Char('c') if event.modifiers.contains(KeyModifiers::CONTROL) => {
                return Some(AppEvent::Exit)
            }
            KeyCode::Char('?') => {
                self.show_help = true;
                self.debug.last_action = "help".to_string();
                return None;
            }
            KeyCode::Char('i') => {
                self.info.open();
                return None;
            }
            KeyCode::Char('r') => {
                self.debug.last_action = "reload".to_string();
                return self.request.clone().map(AppEvent::Load);
            }
            KeyCode::Char('s') => {
                if self.ingester.state().is_active() {
                    self.ingester.stop();
                    self.loading_state = LoadingState::Idle;
                    self.table.on_rows_appended(self.ingester.store());
                    self.status = Some(format!(
                        "Stopped at {} rows",
                        self.ingester.store().row_count()
                    ));
                }
                return None;
            }
            KeyCode::Char('e') => {
                self.start_export(self.options.export_format);
                return None;
            }
            KeyCode::Char('J') => {
                self.start_export(ExportFormat::Json);
                return None;
            }
            KeyCode::Char('c') => {
                self.fetcher.clear_cache();
                self.status = Some("Cache cleared".to_string());
                return None;
            }
            KeyCode::Char('n') => {
                self.table.toggle_row_numbers();
                return None;
            }
            _ => {}
        }

        let Some(store) = current_store(&self.source, &self.ingester) else {
            return None;
        };
        let now = Instant::now();
        let action = match event.code {
            KeyCode::Char('j') | KeyCode::Down => {
                self.table.select_next(store, now);
                "select_next"
            }
            KeyCode::Char('k') | KeyCode::Up => {
                self.table.select_previous(store, now);
                "select_previous"
            }
            KeyCode::PageDown => {
                self.table.page_down(store, now);
                "page_down"
            }
            KeyCode::PageUp => {
                self.table.page_up(store, now);
                "page_up"
            }
            KeyCode::Home | KeyCode::Char('g') => {
                self.table.scroll_to_start(store);
                "scroll_to_start"
            }
            KeyCode::End | KeyCode::Char('G') => {
                self.table.scroll_to_end(store);
                "scroll_to_end"
            }
            KeyCode::Char('h') | KeyCode::Left => {
                self.table.scroll_left();
                "scroll_left"
            }
            KeyCode::Char('l') | KeyCode::Right => {
                self.table.scroll_right();
                "scroll_right"
            }
            _ => return None,
        };
        self.debug.last_action = action.to_string();
        None
    }

    fn status_line(&self) -> Option<String> {
        match &self.export {
            Some(export) => Some(format!("Exporting {:.0}%", export.progress() * 100.0)),
            None => self.status.clone(),
        }
    }

    fn info_context(&self) -> InfoContext {
        let source = match &self.request {
            Some(r) if self.options.stream => format!("question {} (stream)", r.question_id),
            Some(r) => format!("question {}", r.question_id),
            None => "-".to_string(),
        };
        InfoContext {
            source,
            fetch_stats: Some(self.fetcher.stats()),
            ingest: self
                .options
                .stream
                .then(|| (self.ingester.state(), self.ingester.metrics())),
        }
    }

    fn render_loading_gauge(loading_state: &LoadingState, area: Rect, buf: &mut Buffer) {
        if let LoadingState::Loading {
            current_phase,
            progress_percent,
        } = loading_state
        {
            let gauge_width = (area.width as f64 * 0.33) as u16;
            let center_layout = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Fill(1),
                    Constraint::Length(5),
                    Constraint::Fill(1),
                ])
                .split(area);
            let gauge_area = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([
                    Constraint::Fill(1),
                    Constraint::Length(gauge_width),
                    Constraint::Fill(1),
                ])
                .split(center_layout[1])[1];
            Gauge::default()
                .block(Block::default().borders(Borders::ALL).title("Loading"))
                .percent(*progress_percent)
                .label(current_phase.clone())
                .render(gauge_area, buf);
        }
    }

    fn render_help(&mut self, area: Rect, buf: &mut Buffer) {
        let popup_area = centered_rect(area, 60, 60);
        Clear.render(popup_area, buf);
        let block = Block::default()
            .borders(Borders::ALL)
            .title("Help")
            .border_style(Style::default().fg(self.color("modal_border")));
        let inner = block.inner(popup_area);
        block.render(popup_area, buf);

        let total = HELP_TEXT.lines().count();
        let max_scroll = total.saturating_sub(inner.height as usize);
        self.help_scroll = self.help_scroll.min(max_scroll);
        Paragraph::new(HELP_TEXT)
            .scroll((self.help_scroll as u16, 0))
            .render(inner, buf);
    }

    fn render_error(&self, area: Rect, buf: &mut Buffer) {
        let popup_area = centered_rect(area, 70, 40);
        Clear.render(popup_area, buf);
        let block = Block::default()
            .borders(Borders::ALL)
            .title("Error")
            .border_style(Style::default().fg(self.color("modal_border_error")));
        let inner_area = block.inner(popup_area);
        block.render(popup_area, buf);

        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(3)])
            .split(inner_area);
        Paragraph::new(self.error_modal.message.as_str())
            .style(Style::default().fg(self.color("error")))
            .wrap(Wrap { trim: true })
            .render(chunks[0], buf);
        Paragraph::new("[ OK ]")
            .centered()
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.color("primary"))),
            )
            .render(chunks[1], buf);
    }
}

impl<T: QueryTransport, C: StreamConnector> Widget for &mut App<T, C> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        self.debug.num_frames += 1;

        let mut constraints = vec![Constraint::Fill(1), Constraint::Length(1)];
        if self.debug.enabled {
            constraints.push(Constraint::Length(self.debug.height().min(8)));
        }
        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints(constraints)
            .split(area);

        let header_bg = self.color("table_header_bg");
        let header_fg = self.color("table_header");
        let row_numbers_fg = self.color("row_numbers");
        let dimmed = self.color("dimmed");
        let alternate_bg = self.theme.get_optional("alternate_row_bg");
        let border = self.color("modal_border");
        let active = self.color("primary");
        let controls_bg = self.color("controls_bg");

        let main_area = layout[0];
        let mut table_area = main_area;
        if self.info.active {
            let chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Fill(1), Constraint::Max(50)])
                .split(main_area);
            table_area = chunks[0];
            let ctx = self.info_context();
            if let Some(store) = current_store(&self.source, &self.ingester) {
                ResultInfo::new(store, &ctx, &mut self.info, border, active).render(chunks[1], buf);
            }
        }

        if self.loading_state.is_loading() {
            App::<T, C>::render_loading_gauge(&self.loading_state, table_area, buf);
        } else if let Some(store) = current_store(&self.source, &self.ingester) {
            self.table
                .sync_viewport(table_area.height.saturating_sub(1) as usize, store);
            DataTable::new()
                .with_colors(header_bg, header_fg, row_numbers_fg, dimmed)
                .with_alternate_row_bg(alternate_bg)
                .render(table_area, buf, &mut self.table);
        } else {
            Paragraph::new("No question selected. Run `rowscope <QUESTION>` to load one.")
                .style(Style::default().fg(dimmed))
                .render(table_area, buf);
        }

        let row_count = current_store(&self.source, &self.ingester).map(|s| s.row_count());
        let modal_active = self.show_help || self.error_modal.active || self.info.active;
        let controls = Controls::with_row_count(row_count.unwrap_or(0))
            .with_background(controls_bg)
            .with_status(self.status_line())
            .with_dimmed(modal_active)
            .with_streaming(self.ingester.state().is_active());
        (&controls).render(layout[1], buf);

        if self.debug.enabled {
            self.debug.materialized_rows = self.table.virtualizer.surface().row_count();
            self.debug.render_count = self.table.virtualizer.render_count();
            (&self.debug).render(layout[2], buf);
        }

        if self.show_help {
            self.render_help(area, buf);
        }
        if self.error_modal.active {
            self.render_error(area, buf);
        }
    }
}

/// Run the session's question without a terminal and write it to a file in
/// the session's export format.
/// Returns the path of the file written.
pub fn export_headless<T: QueryTransport, C: StreamConnector>(
    options: &SessionOptions,
    fetcher: &DataFetcher<T>,
    ingester: &mut StreamIngester<C>,
    runtime: &tokio::runtime::Handle,
) -> Result<PathBuf> {
    let request = options
        .request
        .as_ref()
        .ok_or_else(|| eyre!("--export needs a question id"))?;

    let fetched;
    let store: &ColumnarStore = if options.stream {
        let (tx, rx) = channel();
        ingester.start(request, Box::new(ChannelObserver::new(tx, 0)));
        while ingester.state().is_active() {
            ingester.pump(Some(Duration::from_millis(100)));
        }
        if let Some(error) = rx.try_iter().find_map(|event| match event {
            AppEvent::StreamFailed { error, .. } => Some(error),
            _ => None,
        }) {
            return Err(eyre!(user_message_from_ingest(&error)));
        }
        ingester.store()
    } else {
        fetched = runtime
            .block_on(fetcher.fetch(request))
            .map_err(|e| eyre!(user_message_from_fetch(&e)))?;
        fetched.as_ref()
    };

    let export = options
        .open_export(store, options.export_format, Some(request))
        .map_err(|e| eyre!(user_message_from_export(&e)))?;
    export
        .run_to_end(store)
        .map_err(|e| eyre!(user_message_from_export(&e)))
}

fn centered_rect(r: Rect, percent_x: u16, percent_y: u16) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
