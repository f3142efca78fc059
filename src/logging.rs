//! In-memory logger.
//!
//! The terminal UI owns stdout and stderr while it runs, so log records go to
//! a bounded ring buffer that the debug overlay displays. Headless runs mirror
//! every record to stderr as well.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

pub const DEFAULT_LOG_LINES: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl std::fmt::Display for LogLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:<5} {}: {}", self.level, self.target, self.message)
    }
}

#[derive(Debug)]
struct Inner {
    lines: VecDeque<LogLine>,
    capacity: usize,
    mirror_to_stderr: bool,
}

/// Shared handle to the log ring buffer. Clones see the same lines.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Inner>>,
    level: LevelFilter,
}

impl LogBuffer {
    pub fn new(capacity: usize, level: LevelFilter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                mirror_to_stderr: false,
            })),
            level,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mirror_to_stderr(&self, mirror: bool) {
        self.lock().mirror_to_stderr = mirror;
    }

    pub fn push(&self, line: LogLine) {
        let mut inner = self.lock();
        if inner.mirror_to_stderr {
            eprintln!("{}", line);
        }
        if inner.lines.len() == inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line);
    }

    /// The newest `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let inner = self.lock();
        let skip = inner.lines.len().saturating_sub(n);
        inner.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().lines.clear();
    }
}

impl Log for LogBuffer {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.push(LogLine {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {}
}

static INSTALLED: OnceLock<LogBuffer> = OnceLock::new();

/// Parse a level name from the config file ("off", "error", ... "trace").
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    name.trim().parse().ok()
}

/// Install the global logger once. Later calls return the buffer from the
/// first call.
pub fn init(capacity: usize, level: LevelFilter) -> LogBuffer {
    INSTALLED
        .get_or_init(|| {
            let buffer = LogBuffer::new(capacity, level);
            if log::set_boxed_logger(Box::new(buffer.clone())).is_ok() {
                log::set_max_level(level);
            }
            buffer
        })
        .clone()
}
