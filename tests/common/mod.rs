#![allow(dead_code)]

use rowscope::sse::SseEvent;
use rowscope::{
    CellValue, Column, ColumnType, ColumnarStore, HttpRequest, HttpResponse, IngestError,
    QueryTransport, StreamConnector, StreamTransport, TransientNetworkError, TransportPoll,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// `id` (integer), `name` (text) and `amount` (float) columns with `n` rows.
pub fn sample_store(n: usize) -> ColumnarStore {
    ColumnarStore::with_rows(sample_columns(), (0..n).map(sample_row).collect())
        .expect("sample rows match the columns")
}

pub fn sample_columns() -> Vec<Column> {
    vec![
        Column::new("id", ColumnType::Integer),
        Column::new("name", ColumnType::Text),
        Column::new("amount", ColumnType::Float),
    ]
}

pub fn sample_row(i: usize) -> Vec<CellValue> {
    vec![
        CellValue::Integer(i as i64),
        CellValue::Text(format!("row {}", i)),
        CellValue::Float(i as f64 * 1.5),
    ]
}

/// Query service body with `n` rows in the `{data: {cols, rows}}` shape.
pub fn table_body(n: usize) -> String {
    let rows: Vec<String> = (0..n)
        .map(|i| format!(r#"[{}, "row {}", {}]"#, i, i, i as f64 * 1.5))
        .collect();
    format!(
        r#"{{"data": {{"cols": [{{"name": "id", "base_type": "type/Integer"}}, {{"name": "name", "base_type": "type/Text"}}, {{"name": "amount", "base_type": "type/Float"}}], "rows": [{}]}}}}"#,
        rows.join(", ")
    )
}

pub fn status(code: u16) -> Result<HttpResponse, TransientNetworkError> {
    Ok(HttpResponse {
        status: code,
        body: String::new(),
    })
}

pub fn ok(body: impl Into<String>) -> Result<HttpResponse, TransientNetworkError> {
    Ok(HttpResponse::ok(body))
}

struct Step {
    delay: Duration,
    response: Result<HttpResponse, TransientNetworkError>,
}

/// Query transport replaying canned responses in order, optionally after a
/// (virtual) delay.
#[derive(Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<HttpResponse, TransientNetworkError>>) -> Self {
        let transport = Self::default();
        for response in responses {
            transport.push(Duration::ZERO, response);
        }
        transport
    }

    pub fn push(&self, delay: Duration, response: Result<HttpResponse, TransientNetworkError>) {
        self.steps
            .lock()
            .unwrap()
            .push_back(Step { delay, response });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl QueryTransport for ScriptedTransport {
    fn get(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransientNetworkError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step {
            delay: Duration::ZERO,
            response: Err(TransientNetworkError::Network("script exhausted".into())),
        });
        async move {
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
            step.response
        }
    }
}

pub fn event(name: &str, data: &str) -> TransportPoll {
    TransportPoll::Event(SseEvent::new(name, data))
}

/// Chunk event with `count` positional rows starting at `first`.
pub fn chunk(number: u64, first: usize, count: usize) -> TransportPoll {
    let rows: Vec<String> = (first..first + count)
        .map(|i| format!(r#"[{}, "row {}", {}]"#, i, i, i as f64 * 1.5))
        .collect();
    event(
        "chunk",
        &format!(
            r#"{{"chunk_number": {}, "rows_in_chunk": {}, "rows": [{}]}}"#,
            number,
            count,
            rows.join(", ")
        ),
    )
}

pub fn start_event() -> TransportPoll {
    event(
        "start",
        r#"{"cols": [{"name": "id", "base_type": "type/Integer"}, {"name": "name", "base_type": "type/Text"}, {"name": "amount", "base_type": "type/Float"}]}"#,
    )
}

/// Stream connector handing out one scripted event list per connection.
/// Once the list runs dry the transport reports `Pending`.
#[derive(Default)]
pub struct ScriptedConnector {
    sessions: Mutex<VecDeque<Vec<TransportPoll>>>,
    closed: Arc<AtomicBool>,
    connects: AtomicUsize,
    refuse: Option<String>,
}

impl ScriptedConnector {
    pub fn new(events: Vec<TransportPoll>) -> Self {
        let connector = Self::default();
        connector.sessions.lock().unwrap().push_back(events);
        connector
    }

    pub fn refusing(reason: &str) -> Self {
        Self {
            refuse: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn push_session(&self, events: Vec<TransportPoll>) {
        self.sessions.lock().unwrap().push_back(events);
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

pub struct ScriptedStream {
    events: VecDeque<TransportPoll>,
    closed: Arc<AtomicBool>,
}

impl StreamTransport for ScriptedStream {
    fn poll_event(&mut self, _wait: Option<Duration>) -> TransportPoll {
        self.events.pop_front().unwrap_or(TransportPoll::Pending)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.clear();
    }
}

impl StreamConnector for ScriptedConnector {
    type Transport = ScriptedStream;

    fn connect(&self, _url: &str, _query: &[(String, String)]) -> Result<ScriptedStream, IngestError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.refuse {
            return Err(IngestError::Connect(reason.clone()));
        }
        let events = self.sessions.lock().unwrap().pop_front().unwrap_or_default();
        Ok(ScriptedStream {
            events: events.into(),
            closed: Arc::clone(&self.closed),
        })
    }
}

/// Read an HTTP request up to the end of its headers.
pub async fn read_request_head(socket: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}

