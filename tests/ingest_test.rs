mod common;

use common::{chunk, event, read_request_head, start_event, ScriptedConnector};
use rowscope::{
    ChunkInfo, ColumnarStore, IngestError, IngestMetrics, IngestObserver, IngestState,
    IngestSummary, QueryRequest, SseConnector, StreamIngester, StreamOptions, TransportPoll,
};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

#[derive(Default)]
struct Log {
    chunks: Vec<ChunkInfo>,
    progress: usize,
    summary: Option<IngestSummary>,
    errors: Vec<IngestError>,
    rows_at_error: Option<usize>,
}

struct Recorder(Rc<RefCell<Log>>);

impl IngestObserver for Recorder {
    fn on_chunk(&mut self, _store: &ColumnarStore, chunk: &ChunkInfo, _metrics: &IngestMetrics) {
        self.0.borrow_mut().chunks.push(chunk.clone());
    }

    fn on_progress(&mut self, _metrics: &IngestMetrics) {
        self.0.borrow_mut().progress += 1;
    }

    fn on_complete(&mut self, _store: &ColumnarStore, summary: &IngestSummary) {
        self.0.borrow_mut().summary = Some(summary.clone());
    }

    fn on_error(&mut self, error: &IngestError, metrics: &IngestMetrics) {
        let mut log = self.0.borrow_mut();
        log.errors.push(error.clone());
        log.rows_at_error = Some(metrics.rows_received as usize);
    }
}

fn ingester(events: Vec<TransportPoll>) -> StreamIngester<ScriptedConnector> {
    StreamIngester::new(ScriptedConnector::new(events), StreamOptions::default())
}

fn pump_until_done(ingester: &mut StreamIngester<ScriptedConnector>) {
    for _ in 0..100 {
        if !ingester.state().is_active() {
            return;
        }
        ingester.pump(None);
    }
}

#[test]
fn test_server_error_keeps_rows_received() {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut ingester = ingester(vec![
        start_event(),
        chunk(1, 0, 100),
        chunk(2, 100, 100),
        chunk(3, 200, 100),
        event("error", r#"{"message": "query killed", "details": "timeout"}"#),
    ]);
    ingester.start(&QueryRequest::new(11u64), Box::new(Recorder(Rc::clone(&log))));
    pump_until_done(&mut ingester);

    assert_eq!(ingester.state(), IngestState::Failed);
    assert_eq!(ingester.store().row_count(), 300);
    let log = log.borrow();
    assert_eq!(log.chunks.len(), 3);
    assert_eq!(log.chunks[2].rows, 200..300);
    assert_eq!(
        log.errors,
        vec![IngestError::Server("query killed (timeout)".to_string())]
    );
    assert_eq!(log.rows_at_error, Some(300));
    assert!(log.summary.is_none());
}

#[test]
fn test_stop_after_failure_is_noop() {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut ingester = ingester(vec![start_event(), chunk(1, 0, 5), TransportPoll::Closed]);
    ingester.start(&QueryRequest::new(1u64), Box::new(Recorder(Rc::clone(&log))));
    pump_until_done(&mut ingester);
    assert_eq!(ingester.state(), IngestState::Failed);
    assert_eq!(log.borrow().errors, vec![IngestError::UnexpectedEnd]);

    ingester.stop();
    assert_eq!(ingester.state(), IngestState::Failed);
    assert_eq!(ingester.store().row_count(), 5);
    assert_eq!(log.borrow().errors.len(), 1);
}

#[test]
fn test_complete_reports_summary() {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut ingester = ingester(vec![
        start_event(),
        chunk(1, 0, 50),
        chunk(2, 50, 25),
        event(
            "complete",
            r#"{"total_rows": 75, "total_chunks": 2, "tempo_total_transmissao": 1.5, "velocidade_media": 50.0}"#,
        ),
    ]);
    ingester.start(&QueryRequest::new(1u64), Box::new(Recorder(Rc::clone(&log))));
    pump_until_done(&mut ingester);

    assert_eq!(ingester.state(), IngestState::Completed);
    let log = log.borrow();
    let summary = log.summary.as_ref().expect("complete fired");
    assert_eq!(summary.total_rows, 75);
    assert_eq!(summary.total_chunks, 2);
    assert_eq!(summary.server.total_rows, Some(75));
    assert_eq!(summary.server.rows_per_second, Some(50.0));
    assert!(log.errors.is_empty());
}

#[test]
fn test_stop_mid_stream_discards_later_events() {
    let log = Rc::new(RefCell::new(Log::default()));
    let connector = ScriptedConnector::new(vec![start_event(), chunk(1, 0, 10)]);
    let mut ingester = StreamIngester::new(connector, StreamOptions::default());
    ingester.start(&QueryRequest::new(1u64), Box::new(Recorder(Rc::clone(&log))));
    ingester.pump(None);
    assert_eq!(ingester.state(), IngestState::Receiving);

    ingester.stop();
    assert_eq!(ingester.state(), IngestState::Cancelled);
    assert_eq!(ingester.pump(None), 0);
    assert_eq!(ingester.store().row_count(), 10);
    assert!(log.borrow().errors.is_empty());
    assert!(log.borrow().summary.is_none());
}

#[test]
fn test_restart_begins_with_empty_store() {
    let connector = ScriptedConnector::new(vec![start_event(), chunk(1, 0, 10)]);
    connector.push_session(vec![start_event(), chunk(1, 0, 3)]);
    let mut ingester = StreamIngester::new(connector, StreamOptions::default());

    ingester.start(&QueryRequest::new(1u64), Box::new(Recorder(Rc::default())));
    ingester.pump(None);
    assert_eq!(ingester.store().row_count(), 10);

    ingester.start(&QueryRequest::new(2u64), Box::new(Recorder(Rc::default())));
    ingester.pump(None);
    assert_eq!(ingester.store().row_count(), 3);
}

#[test]
fn test_connect_failure_reported_once() {
    let log = Rc::new(RefCell::new(Log::default()));
    let mut ingester = StreamIngester::new(
        ScriptedConnector::refusing("connection refused"),
        StreamOptions::default(),
    );
    ingester.start(&QueryRequest::new(1u64), Box::new(Recorder(Rc::clone(&log))));
    assert_eq!(ingester.state(), IngestState::Failed);
    assert_eq!(
        log.borrow().errors,
        vec![IngestError::Connect("connection refused".to_string())]
    );
    assert_eq!(ingester.pump(None), 0);
}

#[test]
fn test_stop_hangs_up_on_the_server() {
    let runtime = Runtime::new().unwrap();
    let listener = runtime
        .block_on(TcpListener::bind(("127.0.0.1", 0)))
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = runtime.spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await;
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n\
                  event: start\ndata: {\"cols\": [{\"name\": \"id\", \"base_type\": \"type/Integer\"}]}\n\n",
            )
            .await
            .unwrap();
        // the stream stays open until the client hangs up
        let mut buf = [0u8; 64];
        tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf)).await
    });

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let connector = SseConnector::with_client(runtime.handle().clone(), client, Duration::from_secs(30));
    let mut ingester = StreamIngester::new(
        connector,
        StreamOptions {
            base_url: format!("http://{}", addr),
            ..StreamOptions::default()
        },
    );
    ingester.start(&QueryRequest::new(1u64), Box::new(Recorder(Rc::default())));
    for _ in 0..50 {
        if ingester.state() == IngestState::Receiving {
            break;
        }
        ingester.pump(Some(Duration::from_millis(100)));
    }
    assert_eq!(ingester.state(), IngestState::Receiving);

    ingester.stop();
    let read = runtime
        .block_on(server)
        .unwrap()
        .expect("server still connected 5s after stop");
    assert!(matches!(read, Ok(0) | Err(_)), "{:?}", read);
}
