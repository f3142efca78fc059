//! Progressive ingestion of a chunked result stream.
//!
//! [`StreamIngester`] is driven by the caller: `start` opens the stream and
//! every `pump` drains the events that have arrived, appending each chunk to
//! the ingester's store before telling the observer about it.

use crate::error::{IngestError, StoreError};
use crate::request::{endpoint_url, QueryRequest};
use crate::response::{decode_row, WireColumn};
use crate::sse::{
    ChunkEvent, CompleteEvent, StartEvent, StreamConnector, StreamEvent, StreamTransport,
    TransportPoll,
};
use crate::store::{Column, ColumnType, ColumnarStore, Row};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::ops::Range;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IngestState {
    #[default]
    Idle,
    Connecting,
    Receiving,
    Completed,
    Failed,
    Cancelled,
}

impl IngestState {
    pub fn is_active(self) -> bool {
        matches!(self, IngestState::Connecting | IngestState::Receiving)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IngestState::Completed | IngestState::Failed | IngestState::Cancelled
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            IngestState::Idle => "idle",
            IngestState::Connecting => "connecting",
            IngestState::Receiving => "receiving",
            IngestState::Completed => "completed",
            IngestState::Failed => "failed",
            IngestState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IngestMetrics {
    pub chunks_received: u64,
    pub rows_received: u64,
    pub elapsed: Duration,
    /// Time from start to the first chunk (query time on the server plus first byte)
    pub time_to_first_chunk: Option<Duration>,
    pub last_sequence_number: Option<u64>,
}

impl IngestMetrics {
    pub fn rows_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.rows_received as f64 / secs
        } else {
            0.0
        }
    }
}

/// A chunk that has just been appended. `rows` is its range in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub sequence_number: u64,
    pub rows_in_chunk: usize,
    pub rows: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestSummary {
    pub total_rows: u64,
    pub total_chunks: u64,
    pub elapsed: Duration,
    pub rows_per_second: f64,
    pub time_to_first_chunk: Option<Duration>,
    /// Totals as reported by the server
    pub server: CompleteEvent,
}

/// Receives ingestion callbacks. All methods default to doing nothing.
pub trait IngestObserver {
    fn on_chunk(&mut self, _store: &ColumnarStore, _chunk: &ChunkInfo, _metrics: &IngestMetrics) {}

    fn on_progress(&mut self, _metrics: &IngestMetrics) {}

    fn on_complete(&mut self, _store: &ColumnarStore, _summary: &IngestSummary) {}

    fn on_error(&mut self, _error: &IngestError, _metrics: &IngestMetrics) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub base_url: String,
    pub stream_path: String,
    /// Rows per chunk requested from the server
    pub chunk_size: Option<usize>,
    /// Upper bound on events handled by one `pump`
    pub max_events_per_pump: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            stream_path: "api/query/stream".to_string(),
            chunk_size: Some(5000),
            max_events_per_pump: 32,
        }
    }
}

impl StreamOptions {
    pub fn url(&self) -> String {
        endpoint_url(&self.base_url, &self.stream_path)
    }

    pub fn query(&self, request: &QueryRequest) -> Vec<(String, String)> {
        let mut pairs = request.query_pairs();
        if let Some(chunk_size) = self.chunk_size {
            pairs.insert(1, ("chunk_size".to_string(), chunk_size.to_string()));
        }
        pairs
    }
}

struct Session<T> {
    transport: T,
    observer: Box<dyn IngestObserver>,
    started: Instant,
    metrics: IngestMetrics,
}

enum Step {
    Continue,
    Finished,
}

pub struct StreamIngester<C: StreamConnector> {
    connector: C,
    options: StreamOptions,
    state: IngestState,
    store: ColumnarStore,
    session: Option<Session<C::Transport>>,
    last_metrics: IngestMetrics,
}

impl<C: StreamConnector> StreamIngester<C> {
    pub fn new(connector: C, options: StreamOptions) -> Self {
        Self {
            connector,
            options,
            state: IngestState::Idle,
            store: ColumnarStore::new(),
            session: None,
            last_metrics: IngestMetrics::default(),
        }
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    /// Rows received so far. Stays readable after failure or cancellation.
    pub fn store(&self) -> &ColumnarStore {
        &self.store
    }

    pub fn take_store(&mut self) -> ColumnarStore {
        std::mem::take(&mut self.store)
    }

    pub fn metrics(&self) -> IngestMetrics {
        match &self.session {
            Some(session) => IngestMetrics {
                elapsed: session.started.elapsed(),
                ..session.metrics
            },
            None => self.last_metrics,
        }
    }

    /// Begin a new session with an empty store. An active session is stopped first.
    pub fn start(&mut self, request: &QueryRequest, mut observer: Box<dyn IngestObserver>) {
        if self.state.is_active() {
            debug!("stopping previous stream before starting a new one");
            self.stop();
        }
        self.store = ColumnarStore::new();
        self.last_metrics = IngestMetrics::default();

        let url = self.options.url();
        let query = self.options.query(request);
        info!("streaming question {} from {}", request.question_id, url);
        match self.connector.connect(&url, &query) {
            Ok(transport) => {
                self.state = IngestState::Connecting;
                self.session = Some(Session {
                    transport,
                    observer,
                    started: Instant::now(),
                    metrics: IngestMetrics::default(),
                });
            }
            Err(e) => {
                error!("could not open stream: {}", e);
                self.state = IngestState::Failed;
                observer.on_error(&e, &self.last_metrics);
            }
        }
    }

    /// Handle pending events. `wait` bounds how long to block for the first
    /// one. Returns the number of events handled.
    pub fn pump(&mut self, wait: Option<Duration>) -> usize {
        let mut handled = 0;
        let mut wait = wait;
        while self.state.is_active() && handled < self.options.max_events_per_pump.max(1) {
            let Some(session) = self.session.as_mut() else {
                break;
            };
            let poll = session.transport.poll_event(wait.take());
            let step = match poll {
                TransportPoll::Pending => break,
                TransportPoll::Event(event) => match StreamEvent::decode(&event) {
                    Ok(Some(event)) => self.handle(event),
                    Ok(None) => {
                        debug!("ignoring '{}' event", event.event);
                        Ok(Step::Continue)
                    }
                    Err(e) => Err(e),
                },
                TransportPoll::Closed => Err(IngestError::UnexpectedEnd),
                TransportPoll::Failed(reason) if self.state == IngestState::Connecting => {
                    Err(IngestError::Connect(reason))
                }
                TransportPoll::Failed(reason) => Err(IngestError::Transport(reason)),
            };
            handled += 1;
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Finished) => break,
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        handled
    }

    /// Cancel the active session. No callbacks fire afterwards. Does nothing
    /// once the session has ended.
    pub fn stop(&mut self) {
        if !self.state.is_active() {
            return;
        }
        if let Some(mut session) = self.session.take() {
            session.transport.close();
            self.last_metrics = IngestMetrics {
                elapsed: session.started.elapsed(),
                ..session.metrics
            };
        }
        info!("stream cancelled after {} rows", self.store.row_count());
        self.state = IngestState::Cancelled;
    }

    fn handle(&mut self, event: StreamEvent) -> Result<Step, IngestError> {
        match event {
            StreamEvent::Start(start) => self.on_start(start).map(|_| Step::Continue),
            StreamEvent::Chunk(chunk) => self.on_chunk(chunk).map(|_| Step::Continue),
            StreamEvent::Complete(complete) => {
                self.complete(complete);
                Ok(Step::Finished)
            }
            StreamEvent::Error(e) => Err(IngestError::Server(e.describe())),
        }
    }

    fn on_start(&mut self, start: StartEvent) -> Result<(), IngestError> {
        self.state = IngestState::Receiving;
        if let Some(total) = start.total_rows {
            debug!("server expects {} rows", total);
        }
        if let Some(cols) = start.cols {
            if !self.store.is_initialized() {
                self.store
                    .init(cols.into_iter().map(WireColumn::into_column).collect())?;
            }
        }
        Ok(())
    }

    fn on_chunk(&mut self, chunk: ChunkEvent) -> Result<(), IngestError> {
        self.state = IngestState::Receiving;
        if !self.store.is_initialized() {
            if let Some(sample) = chunk.rows.first() {
                self.store.init(infer_columns(sample))?;
            }
        }
        let rows = chunk
            .rows
            .iter()
            .enumerate()
            .map(|(i, value)| {
                decode_row(value, self.store.columns()).ok_or_else(|| IngestError::Decode {
                    event: "chunk".to_string(),
                    message: format!("row {} of chunk {} is not an array or object", i, chunk.chunk_number),
                })
            })
            .collect::<Result<Vec<Row>, _>>()?;

        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let received = rows.len();
        if let Some(declared) = chunk.rows_in_chunk {
            if declared != received {
                warn!(
                    "chunk {} declares {} rows but carries {}",
                    chunk.chunk_number, declared, received
                );
            }
        }
        if let Some(last) = session.metrics.last_sequence_number {
            if chunk.chunk_number != last + 1 {
                warn!(
                    "chunk {} arrived after chunk {}; appending in arrival order",
                    chunk.chunk_number, last
                );
            }
        }

        let first_row = self.store.row_count();
        if !rows.is_empty() {
            self.store.append_rows(rows)?;
        }

        let elapsed = session.started.elapsed();
        let metrics = &mut session.metrics;
        if metrics.chunks_received == 0 {
            metrics.time_to_first_chunk = Some(elapsed);
            debug!("first chunk after {:.2}s", elapsed.as_secs_f64());
        }
        metrics.chunks_received += 1;
        metrics.rows_received += received as u64;
        metrics.elapsed = elapsed;
        metrics.last_sequence_number = Some(chunk.chunk_number);

        let info = ChunkInfo {
            sequence_number: chunk.chunk_number,
            rows_in_chunk: received,
            rows: first_row..first_row + received,
        };
        debug!(
            "chunk {}: {} rows (total {} in {:.2}s)",
            info.sequence_number,
            received,
            metrics.rows_received,
            elapsed.as_secs_f64()
        );
        let metrics = *metrics;
        session.observer.on_chunk(&self.store, &info, &metrics);
        session.observer.on_progress(&metrics);
        Ok(())
    }

    fn complete(&mut self, server: CompleteEvent) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.transport.close();
        self.state = IngestState::Completed;

        let mut metrics = session.metrics;
        metrics.elapsed = session.started.elapsed();
        self.last_metrics = metrics;

        if let Some(total) = server.total_rows {
            if total != metrics.rows_received {
                warn!(
                    "server reported {} rows but {} were received",
                    total, metrics.rows_received
                );
            }
        }
        let summary = IngestSummary {
            total_rows: metrics.rows_received,
            total_chunks: metrics.chunks_received,
            elapsed: metrics.elapsed,
            rows_per_second: metrics.rows_per_second(),
            time_to_first_chunk: metrics.time_to_first_chunk,
            server,
        };
        info!(
            "stream complete: {} rows in {} chunks, {:.2}s ({:.0} rows/s)",
            summary.total_rows,
            summary.total_chunks,
            summary.elapsed.as_secs_f64(),
            summary.rows_per_second
        );
        session.observer.on_complete(&self.store, &summary);
    }

    fn fail(&mut self, e: IngestError) {
        let Some(mut session) = self.session.take() else {
            self.state = IngestState::Failed;
            return;
        };
        session.transport.close();
        self.state = IngestState::Failed;

        let mut metrics = session.metrics;
        metrics.elapsed = session.started.elapsed();
        self.last_metrics = metrics;
        if let IngestError::SchemaMismatch(StoreError::SchemaMismatch { .. }) = &e {
            error!("stream stopped on a malformed chunk; keeping {} rows", self.store.row_count());
        } else {
            error!("stream failed after {} rows: {}", self.store.row_count(), e);
        }
        session.observer.on_error(&e, &metrics);
    }
}

/// Columns for a stream that did not announce any: object rows give named
/// columns with guessed types, array rows give `column_1..n` as text.
fn infer_columns(sample: &Value) -> Vec<Column> {
    match sample {
        Value::Object(map) => map
            .iter()
            .map(|(name, value)| Column::new(name.clone(), ColumnType::guess(value)))
            .collect(),
        Value::Array(cells) => (1..=cells.len())
            .map(|i| Column::new(format!("column_{}", i), ColumnType::Text))
            .collect(),
        _ => Vec::new(),
    }
}
