//! CSV and JSON export in bounded batches.
//!
//! [`CsvExport`] and [`JsonExport`] snapshot the row count when they are
//! created and then emit an opening piece followed by batches of `chunk_size`
//! rows, one per call, so the caller can interleave other work between
//! batches. Rows appended to the store after the snapshot are not exported.

use crate::error::ExportError;
use crate::format::{ColumnFormatters, FormatStrategy};
use crate::request::QueryRequest;
use crate::store::{ColumnarStore, Row};
use crate::{CompressionFormat, ExportFormat};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const DEFAULT_EXPORT_CHUNK_SIZE: usize = 50_000;

const UTF8_BOM: &str = "\u{feff}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    #[default]
    Lf,
    Crlf,
}

impl LineEnding {
    fn terminator(self) -> csv::Terminator {
        match self {
            LineEnding::Lf => csv::Terminator::Any(b'\n'),
            LineEnding::Crlf => csv::Terminator::CRLF,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub delimiter: char,
    pub include_header: bool,
    pub line_ending: LineEnding,
    /// Prefix the output with a UTF-8 byte order mark (spreadsheet friendly).
    pub byte_order_mark: bool,
    pub chunk_size: usize,
    /// JSON only: wrap the rows in an object carrying export metadata
    pub include_metadata: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            include_header: true,
            line_ending: LineEnding::Lf,
            byte_order_mark: false,
            chunk_size: DEFAULT_EXPORT_CHUNK_SIZE,
            include_metadata: false,
        }
    }
}

/// The csv writer takes a single byte; quotes and line breaks are reserved.
fn delimiter_byte(delimiter: char) -> Result<u8, ExportError> {
    match u8::try_from(delimiter) {
        Ok(b) if b.is_ascii() && !matches!(b, b'"' | b'\n' | b'\r') => Ok(b),
        _ => Err(ExportError::InvalidDelimiter(delimiter)),
    }
}

/// One export run. Create a new one to export again.
#[derive(Debug)]
pub struct CsvExport {
    options: ExportOptions,
    delimiter: u8,
    formatters: ColumnFormatters,
    header: Option<Vec<String>>,
    total_rows: usize,
    next_row: usize,
    finished: bool,
}

impl CsvExport {
    pub fn new(
        store: &ColumnarStore,
        mut options: ExportOptions,
        strategy: &dyn FormatStrategy,
    ) -> Result<Self, ExportError> {
        if !store.is_initialized() {
            return Err(ExportError::NoSchema);
        }
        let delimiter = delimiter_byte(options.delimiter)?;
        options.chunk_size = options.chunk_size.max(1);
        let header = options
            .include_header
            .then(|| store.columns().iter().map(|c| c.name.clone()).collect());
        Ok(Self {
            formatters: ColumnFormatters::resolve(store.columns(), strategy),
            options,
            delimiter,
            header,
            total_rows: store.row_count(),
            next_row: 0,
            finished: false,
        })
    }

    /// Rows this export will write, fixed at creation.
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn rows_written(&self) -> usize {
        self.next_row
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn progress(&self) -> f64 {
        progress(self.next_row, self.total_rows, self.finished)
    }

    /// Encode `records` after `prefix`. Fields are quoted only when they hold
    /// the delimiter, a quote or a line break.
    fn encode<I, R, F>(&self, prefix: &str, records: I) -> Result<String, ExportError>
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(self.options.line_ending.terminator())
            .from_writer(prefix.as_bytes().to_vec());
        for record in records {
            writer.write_record(record)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| ExportError::Io(e.into_error()))?;
        String::from_utf8(bytes)
            .map_err(|e| ExportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Next piece of CSV text: the header first (with the BOM when enabled),
    /// then one batch of rows per call. `None` once everything is written.
    pub fn next_chunk(&mut self, store: &ColumnarStore) -> Option<Result<String, ExportError>> {
        if self.finished {
            return None;
        }

        if let Some(header) = self.header.take() {
            let bom = if self.options.byte_order_mark { UTF8_BOM } else { "" };
            return Some(self.encode(bom, [header]));
        }

        if self.next_row >= self.total_rows {
            self.finished = true;
            if self.total_rows == 0 && self.options.byte_order_mark && !self.options.include_header
            {
                return Some(Ok(UTF8_BOM.to_string()));
            }
            return None;
        }

        let batch = match next_batch(
            store,
            self.next_row,
            self.total_rows,
            self.options.chunk_size,
        ) {
            Ok(batch) => batch,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        let bom = if self.next_row == 0
            && self.options.byte_order_mark
            && !self.options.include_header
        {
            UTF8_BOM
        } else {
            ""
        };
        let records = batch.iter().map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, value)| self.formatters.format(i, value))
        });
        let chunk = self.encode(bom, records);
        if chunk.is_err() {
            self.finished = true;
        }
        self.next_row += batch.len();
        Some(chunk)
    }
}

fn progress(written: usize, total: usize, finished: bool) -> f64 {
    if total == 0 {
        return if finished { 1.0 } else { 0.0 };
    }
    written as f64 / total as f64
}

/// Rows `[next_row, next_row + chunk_size)` of the snapshot, or an error when
/// the store no longer holds them.
fn next_batch(
    store: &ColumnarStore,
    next_row: usize,
    total_rows: usize,
    chunk_size: usize,
) -> Result<&[Row], ExportError> {
    if store.row_count() < total_rows {
        return Err(ExportError::StoreChanged {
            expected: total_rows,
            found: store.row_count(),
        });
    }
    let end = (next_row + chunk_size).min(total_rows);
    Ok(store.rows(next_row..end))
}

/// Context written ahead of the rows of a JSON export.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonMetadata {
    pub exported_at: DateTime<Utc>,
    pub query: Option<QueryRequest>,
}

impl JsonMetadata {
    pub fn new(exported_at: DateTime<Utc>, query: Option<QueryRequest>) -> Self {
        Self { exported_at, query }
    }
}

#[derive(Serialize)]
struct MetadataRecord<'a> {
    exported_at: String,
    row_count: usize,
    query: Option<&'a QueryRequest>,
    columns: Vec<&'a str>,
}

/// JSON export: an array of objects keyed by column name, optionally wrapped
/// as `{"metadata": {...}, "data": [...]}`. Cells keep their JSON types.
#[derive(Debug)]
pub struct JsonExport {
    columns: Vec<String>,
    chunk_size: usize,
    opening: Option<String>,
    closing: &'static str,
    total_rows: usize,
    next_row: usize,
    finished: bool,
}

impl JsonExport {
    pub fn new(
        store: &ColumnarStore,
        chunk_size: usize,
        metadata: Option<JsonMetadata>,
    ) -> Result<Self, ExportError> {
        if !store.is_initialized() {
            return Err(ExportError::NoSchema);
        }
        let columns: Vec<String> = store.columns().iter().map(|c| c.name.clone()).collect();
        let (opening, closing) = match metadata {
            Some(metadata) => {
                let record = MetadataRecord {
                    exported_at: metadata
                        .exported_at
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                    row_count: store.row_count(),
                    query: metadata.query.as_ref(),
                    columns: columns.iter().map(String::as_str).collect(),
                };
                (
                    format!("{{\"metadata\":{},\"data\":[", serde_json::to_string(&record)?),
                    "]}\n",
                )
            }
            None => ("[".to_string(), "]\n"),
        };
        Ok(Self {
            columns,
            chunk_size: chunk_size.max(1),
            opening: Some(opening),
            closing,
            total_rows: store.row_count(),
            next_row: 0,
            finished: false,
        })
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn rows_written(&self) -> usize {
        self.next_row
    }

    pub fn progress(&self) -> f64 {
        progress(self.next_row, self.total_rows, self.finished)
    }

    fn row_object(&self, row: &Row) -> Value {
        let object: Map<String, Value> = self
            .columns
            .iter()
            .zip(row.iter())
            .map(|(name, cell)| (name.clone(), cell.to_json()))
            .collect();
        Value::Object(object)
    }

    /// The opening bracket (and metadata) first, then one batch of row
    /// objects per call, then the closing bracket. `None` once done.
    pub fn next_chunk(&mut self, store: &ColumnarStore) -> Option<Result<String, ExportError>> {
        if self.finished {
            return None;
        }
        if let Some(opening) = self.opening.take() {
            return Some(Ok(opening));
        }
        if self.next_row >= self.total_rows {
            self.finished = true;
            let newline = if self.total_rows > 0 { "\n" } else { "" };
            return Some(Ok(format!("{}{}", newline, self.closing)));
        }

        let batch = match next_batch(store, self.next_row, self.total_rows, self.chunk_size) {
            Ok(batch) => batch,
            Err(e) => {
                self.finished = true;
                return Some(Err(e));
            }
        };
        let mut out = String::new();
        for (i, row) in batch.iter().enumerate() {
            out.push_str(if self.next_row + i == 0 { "\n" } else { ",\n" });
            match serde_json::to_string(&self.row_object(row)) {
                Ok(text) => out.push_str(&text),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }
        }
        self.next_row += batch.len();
        Some(Ok(out))
    }
}

/// Either export cursor, as driven by [`FileExport`].
#[derive(Debug)]
pub enum ChunkedExport {
    Csv(CsvExport),
    Json(JsonExport),
}

impl ChunkedExport {
    pub fn format(&self) -> ExportFormat {
        match self {
            ChunkedExport::Csv(_) => ExportFormat::Csv,
            ChunkedExport::Json(_) => ExportFormat::Json,
        }
    }

    pub fn next_chunk(&mut self, store: &ColumnarStore) -> Option<Result<String, ExportError>> {
        match self {
            ChunkedExport::Csv(e) => e.next_chunk(store),
            ChunkedExport::Json(e) => e.next_chunk(store),
        }
    }

    pub fn total_rows(&self) -> usize {
        match self {
            ChunkedExport::Csv(e) => e.total_rows(),
            ChunkedExport::Json(e) => e.total_rows(),
        }
    }

    pub fn rows_written(&self) -> usize {
        match self {
            ChunkedExport::Csv(e) => e.rows_written(),
            ChunkedExport::Json(e) => e.rows_written(),
        }
    }

    pub fn progress(&self) -> f64 {
        match self {
            ChunkedExport::Csv(e) => e.progress(),
            ChunkedExport::Json(e) => e.progress(),
        }
    }
}

impl From<CsvExport> for ChunkedExport {
    fn from(export: CsvExport) -> Self {
        ChunkedExport::Csv(export)
    }
}

impl From<JsonExport> for ChunkedExport {
    fn from(export: JsonExport) -> Self {
        ChunkedExport::Json(export)
    }
}

/// Iterator over the chunks of one export.
pub struct ExportChunks<'a> {
    store: &'a ColumnarStore,
    export: ChunkedExport,
}

impl Iterator for ExportChunks<'_> {
    type Item = Result<String, ExportError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.export.next_chunk(self.store)
    }
}

/// Lazy chunk sequence for `store`. Each call starts a fresh export.
pub fn export_csv<'a>(
    store: &'a ColumnarStore,
    options: ExportOptions,
    strategy: &dyn FormatStrategy,
) -> Result<ExportChunks<'a>, ExportError> {
    Ok(ExportChunks {
        store,
        export: CsvExport::new(store, options, strategy)?.into(),
    })
}

/// Whole export as one string.
pub fn export_csv_string(
    store: &ColumnarStore,
    options: ExportOptions,
    strategy: &dyn FormatStrategy,
) -> Result<String, ExportError> {
    export_csv(store, options, strategy)?.collect()
}

/// Whole JSON export as one string.
pub fn export_json_string(
    store: &ColumnarStore,
    metadata: Option<JsonMetadata>,
) -> Result<String, ExportError> {
    ExportChunks {
        store,
        export: JsonExport::new(store, DEFAULT_EXPORT_CHUNK_SIZE, metadata)?.into(),
    }
    .collect()
}

/// `export_<date>.<csv|json>`, plus the compression extension when compressed.
pub fn export_file_name(
    date: NaiveDate,
    format: ExportFormat,
    compression: Option<CompressionFormat>,
) -> String {
    let base = format!("export_{}.{}", date.format("%Y-%m-%d"), format.extension());
    match compression {
        Some(c) => format!("{}.{}", base, c.extension()),
        None => base,
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(flate2::write::GzEncoder<BufWriter<File>>),
    Zstd(zstd::Encoder<'static, BufWriter<File>>),
    Bzip2(bzip2::write::BzEncoder<BufWriter<File>>),
    Xz(xz2::write::XzEncoder<BufWriter<File>>),
}

impl Sink {
    fn new(file: File, compression: Option<CompressionFormat>) -> io::Result<Self> {
        let file = BufWriter::new(file);
        Ok(match compression {
            None => Sink::Plain(file),
            Some(CompressionFormat::Gzip) => Sink::Gzip(flate2::write::GzEncoder::new(
                file,
                flate2::Compression::default(),
            )),
            Some(CompressionFormat::Zstd) => Sink::Zstd(zstd::Encoder::new(file, 0)?),
            Some(CompressionFormat::Bzip2) => Sink::Bzip2(bzip2::write::BzEncoder::new(
                file,
                bzip2::Compression::default(),
            )),
            Some(CompressionFormat::Xz) => Sink::Xz(xz2::write::XzEncoder::new(file, 6)),
        })
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.write_all(bytes),
            Sink::Gzip(w) => w.write_all(bytes),
            Sink::Zstd(w) => w.write_all(bytes),
            Sink::Bzip2(w) => w.write_all(bytes),
            Sink::Xz(w) => w.write_all(bytes),
        }
    }

    /// Flush encoder trailers and the underlying buffer.
    fn finish(self) -> io::Result<()> {
        let mut inner = match self {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish()?,
            Sink::Zstd(w) => w.finish()?,
            Sink::Bzip2(w) => w.finish()?,
            Sink::Xz(w) => w.finish()?,
        };
        inner.flush()?;
        inner.get_ref().sync_all()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportProgress {
    Writing { rows_written: usize, total_rows: usize },
    Finished { path: PathBuf, rows: usize },
}

/// Export written to a temporary file in the destination directory and
/// renamed into place only when every batch succeeded.
pub struct FileExport {
    export: ChunkedExport,
    sink: Option<Sink>,
    temp: Option<NamedTempFile>,
    destination: PathBuf,
}

impl FileExport {
    pub fn create(
        export: impl Into<ChunkedExport>,
        destination: impl Into<PathBuf>,
        compression: Option<CompressionFormat>,
    ) -> Result<Self, ExportError> {
        let export = export.into();
        let destination = destination.into();
        let directory = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&directory)?;
        let temp = NamedTempFile::new_in(&directory)?;
        let sink = Sink::new(temp.as_file().try_clone()?, compression)?;
        Ok(Self {
            export,
            sink: Some(sink),
            temp: Some(temp),
            destination,
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn format(&self) -> ExportFormat {
        self.export.format()
    }

    pub fn total_rows(&self) -> usize {
        self.export.total_rows()
    }

    pub fn progress(&self) -> f64 {
        self.export.progress()
    }

    /// Write one chunk. After the last one the file is moved to its
    /// destination. On error the temporary file is removed.
    pub fn step(&mut self, store: &ColumnarStore) -> Result<ExportProgress, ExportError> {
        let chunk = match self.export.next_chunk(store) {
            Some(chunk) => chunk,
            None => return self.finish(),
        };
        let written = chunk.and_then(|text| match self.sink.as_mut() {
            Some(sink) => sink.write_all(text.as_bytes()).map_err(ExportError::from),
            None => Err(ExportError::Io(io::Error::other("export already finished"))),
        });
        if let Err(e) = written {
            self.abort();
            return Err(e);
        }
        Ok(ExportProgress::Writing {
            rows_written: self.export.rows_written(),
            total_rows: self.export.total_rows(),
        })
    }

    fn finish(&mut self) -> Result<ExportProgress, ExportError> {
        let (Some(sink), Some(temp)) = (self.sink.take(), self.temp.take()) else {
            return Err(ExportError::Io(io::Error::other("export already finished")));
        };
        sink.finish()?;
        temp.persist(&self.destination).map_err(|e| e.error)?;
        Ok(ExportProgress::Finished {
            path: self.destination.clone(),
            rows: self.export.total_rows(),
        })
    }

    fn abort(&mut self) {
        self.sink = None;
        self.temp = None;
    }

    /// Write every remaining chunk.
    pub fn run_to_end(mut self, store: &ColumnarStore) -> Result<PathBuf, ExportError> {
        loop {
            if let ExportProgress::Finished { path, .. } = self.step(store)? {
                return Ok(path);
            }
        }
    }
}
