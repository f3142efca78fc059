//! Server-sent events: line parser, the stream's event payloads, and a
//! reqwest-backed transport that reads the event stream on a runtime task.

use crate::error::IngestError;
use crate::response::WireColumn;
use futures_util::StreamExt;
use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }
}

/// Incremental `text/event-stream` parser. Feed it one line at a time; a
/// blank line dispatches the event collected so far.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // retry and unknown fields carry nothing we use
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
            id: self.id.clone(),
        })
    }
}

/// Payload of the optional `start` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartEvent {
    #[serde(default, alias = "columns")]
    pub cols: Option<Vec<WireColumn>>,
    #[serde(default)]
    pub total_rows: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkEvent {
    pub chunk_number: u64,
    #[serde(default)]
    pub rows_in_chunk: Option<usize>,
    pub rows: Vec<Value>,
}

/// Totals reported by the server when the stream ends.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CompleteEvent {
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub total_chunks: Option<u64>,
    #[serde(default, rename = "tempo_sql")]
    pub query_secs: Option<f64>,
    #[serde(default, rename = "tempo_transmissao_dados")]
    pub transfer_secs: Option<f64>,
    #[serde(default, rename = "tempo_total_transmissao")]
    pub total_secs: Option<f64>,
    #[serde(default, rename = "velocidade_media")]
    pub rows_per_second: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorEvent {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

impl ErrorEvent {
    pub fn describe(&self) -> String {
        let base = self
            .message
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("unknown server error");
        match &self.details {
            Some(Value::String(d)) if !d.is_empty() => format!("{} ({})", base, d),
            _ => base.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start(StartEvent),
    Chunk(ChunkEvent),
    Complete(CompleteEvent),
    Error(ErrorEvent),
}

fn payload<T: DeserializeOwned + Default>(event: &SseEvent) -> Result<T, IngestError> {
    if event.data.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&event.data).map_err(|e| IngestError::Decode {
        event: event.event.clone(),
        message: e.to_string(),
    })
}

impl StreamEvent {
    /// Decode a raw event. Event names the stream does not define yield `None`.
    pub fn decode(event: &SseEvent) -> Result<Option<Self>, IngestError> {
        Ok(Some(match event.event.as_str() {
            "start" => StreamEvent::Start(payload(event)?),
            "chunk" => StreamEvent::Chunk(serde_json::from_str(&event.data).map_err(|e| {
                IngestError::Decode {
                    event: event.event.clone(),
                    message: e.to_string(),
                }
            })?),
            "complete" => StreamEvent::Complete(payload(event)?),
            "error" => StreamEvent::Error(payload(event).unwrap_or_else(|_| ErrorEvent {
                message: Some(event.data.clone()),
                ..ErrorEvent::default()
            })),
            _ => return Ok(None),
        }))
    }
}

/// Result of polling a stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportPoll {
    Event(SseEvent),
    /// Nothing arrived within the wait
    Pending,
    /// The server ended the stream
    Closed,
    Failed(String),
}

pub trait StreamTransport {
    /// Next event. With `wait: None` this never blocks.
    fn poll_event(&mut self, wait: Option<Duration>) -> TransportPoll;

    /// Stop reading. Events not yet polled are discarded.
    fn close(&mut self);
}

pub trait StreamConnector {
    type Transport: StreamTransport;

    fn connect(&self, url: &str, query: &[(String, String)]) -> Result<Self::Transport, IngestError>;
}

enum ReaderMessage {
    Event(SseEvent),
    Closed,
    Failed(String),
}

/// Opens event streams with reqwest. Each stream is read by a task on the
/// given runtime that hands parsed events over a channel; closing the
/// transport aborts the task, which drops the response and its connection.
#[derive(Clone)]
pub struct SseConnector {
    client: reqwest::Client,
    runtime: Handle,
    idle_timeout: Duration,
}

impl SseConnector {
    /// `idle_timeout` bounds the wait for the next bytes, not the stream length.
    pub fn new(
        runtime: Handle,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| IngestError::Connect(e.to_string()))?;
        Ok(Self::with_client(runtime, client, idle_timeout))
    }

    pub fn with_client(runtime: Handle, client: reqwest::Client, idle_timeout: Duration) -> Self {
        Self {
            client,
            runtime,
            idle_timeout,
        }
    }
}

/// Splits received bytes into lines for the parser. A line may arrive over
/// several network reads.
fn forward_lines(
    pending: &mut Vec<u8>,
    parser: &mut SseParser,
    tx: &Sender<ReaderMessage>,
) -> Result<(), mpsc::SendError<ReaderMessage>> {
    while let Some(end) = pending.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = pending.drain(..=end).collect();
        if let Some(event) = parser.push_line(&String::from_utf8_lossy(&line)) {
            trace!("sse event '{}' ({} bytes)", event.event, event.data.len());
            tx.send(ReaderMessage::Event(event))?;
        }
    }
    Ok(())
}

async fn read_stream(
    request: reqwest::RequestBuilder,
    idle_timeout: Duration,
    tx: Sender<ReaderMessage>,
) {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = tx.send(ReaderMessage::Failed(e.to_string()));
            return;
        }
    };
    if !response.status().is_success() {
        let _ = tx.send(ReaderMessage::Failed(format!("HTTP {}", response.status().as_u16())));
        return;
    }

    let mut body = response.bytes_stream();
    let mut parser = SseParser::new();
    let mut pending = Vec::new();
    loop {
        let next = match tokio::time::timeout(idle_timeout, body.next()).await {
            Ok(next) => next,
            Err(_) => {
                let _ = tx.send(ReaderMessage::Failed(format!(
                    "no data received for {:?}",
                    idle_timeout
                )));
                return;
            }
        };
        match next {
            Some(Ok(bytes)) => {
                pending.extend_from_slice(&bytes);
                if forward_lines(&mut pending, &mut parser, &tx).is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(ReaderMessage::Failed(e.to_string()));
                return;
            }
            None => {
                // a final line without its newline still counts
                if !pending.is_empty() {
                    pending.push(b'\n');
                    let _ = forward_lines(&mut pending, &mut parser, &tx);
                }
                let _ = tx.send(ReaderMessage::Closed);
                return;
            }
        }
    }
}

impl StreamConnector for SseConnector {
    type Transport = SseTransport;

    fn connect(&self, url: &str, query: &[(String, String)]) -> Result<SseTransport, IngestError> {
        let (tx, rx) = mpsc::channel();
        let request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .query(query);
        debug!("opening event stream {}", url);
        let task = self.runtime.spawn(read_stream(request, self.idle_timeout, tx));

        Ok(SseTransport {
            receiver: Some(rx),
            task: Some(task),
        })
    }
}

pub struct SseTransport {
    receiver: Option<Receiver<ReaderMessage>>,
    task: Option<JoinHandle<()>>,
}

impl StreamTransport for SseTransport {
    fn poll_event(&mut self, wait: Option<Duration>) -> TransportPoll {
        let Some(receiver) = self.receiver.as_ref() else {
            return TransportPoll::Closed;
        };
        let message = match wait {
            Some(wait) => match receiver.recv_timeout(wait) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => return TransportPoll::Pending,
                Err(RecvTimeoutError::Disconnected) => return TransportPoll::Closed,
            },
            None => match receiver.try_recv() {
                Ok(message) => message,
                Err(TryRecvError::Empty) => return TransportPoll::Pending,
                Err(TryRecvError::Disconnected) => return TransportPoll::Closed,
            },
        };
        match message {
            ReaderMessage::Event(event) => TransportPoll::Event(event),
            ReaderMessage::Closed => TransportPoll::Closed,
            ReaderMessage::Failed(reason) => TransportPoll::Failed(reason),
        }
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.receiver = None;
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<SseEvent> {
        let mut parser = SseParser::new();
        text.split_inclusive('\n')
            .filter_map(|line| parser.push_line(line))
            .collect()
    }

    #[test]
    fn test_parses_named_events() {
        let events = parse("event: start\ndata: {}\n\nevent: chunk\ndata: {\"a\":1}\n\n");
        assert_eq!(
            events,
            vec![SseEvent::new("start", "{}"), SseEvent::new("chunk", "{\"a\":1}")]
        );
    }

    #[test]
    fn test_multiline_data_comments_and_crlf() {
        let events = parse(": keep-alive\r\nevent: chunk\r\ndata: line1\r\ndata:line2\r\nid: 7\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn test_event_without_data_is_not_dispatched() {
        let events = parse("event: ping\n\ndata: hello\n\n");
        assert_eq!(events, vec![SseEvent::new("message", "hello")]);
    }

    #[test]
    fn test_incomplete_event_is_held_back() {
        let mut parser = SseParser::new();
        assert!(parser.push_line("event: chunk\n").is_none());
        assert!(parser.push_line("data: {}\n").is_none());
        assert!(parser.push_line("\n").is_some());
    }

    #[test]
    fn test_lines_split_across_reads() {
        let (tx, rx) = mpsc::channel();
        let mut parser = SseParser::new();
        let mut pending = b"event: chunk\ndata: {\"a\"".to_vec();
        forward_lines(&mut pending, &mut parser, &tx).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(pending, b"data: {\"a\"".to_vec());

        pending.extend_from_slice(b":1}\r\n\r\n");
        forward_lines(&mut pending, &mut parser, &tx).unwrap();
        match rx.try_recv().unwrap() {
            ReaderMessage::Event(event) => assert_eq!(event, SseEvent::new("chunk", "{\"a\":1}")),
            _ => panic!("expected an event"),
        }
        assert!(pending.is_empty());
    }

    #[test]
    fn test_decode_complete_with_server_totals() {
        let event = SseEvent::new(
            "complete",
            r#"{"total_rows": 300, "total_chunks": 3, "tempo_total_transmissao": 1.5, "velocidade_media": 200.0}"#,
        );
        match StreamEvent::decode(&event).unwrap() {
            Some(StreamEvent::Complete(c)) => {
                assert_eq!(c.total_rows, Some(300));
                assert_eq!(c.total_secs, Some(1.5));
                assert_eq!(c.rows_per_second, Some(200.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors_and_unknown_events() {
        assert!(StreamEvent::decode(&SseEvent::new("heartbeat", "x")).unwrap().is_none());
        assert!(matches!(
            StreamEvent::decode(&SseEvent::new("chunk", "{not json")),
            Err(IngestError::Decode { .. })
        ));
        match StreamEvent::decode(&SseEvent::new("error", "plain text failure")).unwrap() {
            Some(StreamEvent::Error(e)) => assert_eq!(e.describe(), "plain text failure"),
            other => panic!("unexpected {:?}", other),
        }
        match StreamEvent::decode(&SseEvent::new("error", r#"{"error": "Erro de conexão"}"#)).unwrap() {
            Some(StreamEvent::Error(e)) => assert_eq!(e.describe(), "Erro de conexão"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
