mod common;

use common::{sample_columns, sample_row, sample_store};
use rowscope::{
    export_csv, export_csv_string, CellValue, ColumnarStore, CompressionFormat, CsvExport,
    ExportError, ExportOptions, ExportProgress, FileExport, JsonExport, JsonMetadata,
    PlainFormat, QueryRequest,
};
use std::io::Read;
use tempfile::TempDir;

fn parse_csv(text: &str) -> Vec<Vec<String>> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(text.as_bytes())
        .records()
        .map(|record| record.unwrap().iter().map(str::to_string).collect())
        .collect()
}

fn csv_file_export(
    store: &ColumnarStore,
    options: ExportOptions,
    destination: &std::path::Path,
    compression: Option<CompressionFormat>,
) -> FileExport {
    let export = CsvExport::new(store, options, &PlainFormat).unwrap();
    FileExport::create(export, destination, compression).unwrap()
}

fn tricky_store() -> ColumnarStore {
    let mut rows: Vec<_> = (0..10).map(sample_row).collect();
    rows.push(vec![
        CellValue::Integer(10),
        CellValue::Text("Rua \"A\", 12\nfundos".to_string()),
        CellValue::Null,
    ]);
    ColumnarStore::with_rows(sample_columns(), rows).unwrap()
}

#[test]
fn test_exported_csv_reads_back_to_the_same_cells() {
    let store = tricky_store();
    let csv = export_csv_string(&store, ExportOptions::default(), &PlainFormat).unwrap();
    let records = parse_csv(&csv);

    assert_eq!(records[0], vec!["id", "name", "amount"]);
    assert_eq!(records.len(), store.row_count() + 1);
    for (record, row) in records[1..].iter().zip(store.rows(0..store.row_count())) {
        let expected: Vec<String> = row.iter().map(|c| c.to_string()).collect();
        assert_eq!(record, &expected);
    }
    assert_eq!(records[11][1], "Rua \"A\", 12\nfundos");
}

#[test]
fn test_rows_appended_during_export_are_left_out() {
    let mut store = sample_store(10);
    let options = ExportOptions {
        chunk_size: 4,
        ..ExportOptions::default()
    };
    let mut export = CsvExport::new(&store, options, &PlainFormat).unwrap();
    let mut csv = String::new();
    csv.push_str(&export.next_chunk(&store).unwrap().unwrap());
    csv.push_str(&export.next_chunk(&store).unwrap().unwrap());

    store
        .append_rows((10..25).map(sample_row).collect())
        .unwrap();
    while let Some(chunk) = export.next_chunk(&store) {
        csv.push_str(&chunk.unwrap());
    }

    assert_eq!(export.total_rows(), 10);
    assert_eq!(export.progress(), 1.0);
    let records = parse_csv(&csv);
    assert_eq!(records.len(), 11);
    assert_eq!(records[10][0], "9");
}

#[test]
fn test_every_export_starts_over() {
    let store = sample_store(3);
    let first: Vec<String> = export_csv(&store, ExportOptions::default(), &PlainFormat)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let second: Vec<String> = export_csv(&store, ExportOptions::default(), &PlainFormat)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_empty_store_exports_header_only() {
    let store = sample_store(0);
    let csv = export_csv_string(&store, ExportOptions::default(), &PlainFormat).unwrap();
    assert_eq!(csv, "id,name,amount\n");
}

#[test]
fn test_file_export_reports_progress_and_renames() {
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("out").join("export.csv");
    let store = sample_store(10);
    let options = ExportOptions {
        chunk_size: 5,
        ..ExportOptions::default()
    };
    let mut export = csv_file_export(&store, options, &destination, None);

    let mut steps = Vec::new();
    loop {
        match export.step(&store).unwrap() {
            ExportProgress::Writing { rows_written, .. } => steps.push(rows_written),
            ExportProgress::Finished { path, rows } => {
                assert_eq!(path, destination);
                assert_eq!(rows, 10);
                break;
            }
        }
    }
    assert_eq!(steps, vec![0, 5, 10]);

    let text = std::fs::read_to_string(&destination).unwrap();
    assert_eq!(parse_csv(&text).len(), 11);
    // only the final file is left behind
    assert_eq!(std::fs::read_dir(destination.parent().unwrap()).unwrap().count(), 1);
}

#[test]
fn test_gzip_export_decompresses() {
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("export.csv.gz");
    let store = sample_store(100);
    let path = csv_file_export(
        &store,
        ExportOptions::default(),
        &destination,
        Some(CompressionFormat::Gzip),
    )
    .run_to_end(&store)
    .unwrap();

    let mut text = String::new();
    flate2::read::GzDecoder::new(std::fs::File::open(&path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    let records = parse_csv(&text);
    assert_eq!(records.len(), 101);
    assert_eq!(records[42][0], "41");
    assert_eq!(records[42][1], "row 41");
}

#[test]
fn test_zstd_export_decompresses() {
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("export.csv.zst");
    let store = sample_store(20);
    let path = csv_file_export(
        &store,
        ExportOptions::default(),
        &destination,
        Some(CompressionFormat::Zstd),
    )
    .run_to_end(&store)
    .unwrap();

    let bytes = zstd::decode_all(std::fs::File::open(&path).unwrap()).unwrap();
    let expected = export_csv_string(&store, ExportOptions::default(), &PlainFormat).unwrap();
    assert_eq!(String::from_utf8(bytes).unwrap(), expected);
}

#[test]
fn test_failed_export_leaves_no_file() {
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("export.csv");
    let mut store = sample_store(10);
    let options = ExportOptions {
        chunk_size: 3,
        ..ExportOptions::default()
    };
    let mut export = csv_file_export(&store, options, &destination, None);
    export.step(&store).unwrap();
    export.step(&store).unwrap();

    store.reset();
    let err = export.step(&store).unwrap_err();
    assert!(matches!(err, ExportError::StoreChanged { expected: 10, found: 0 }));
    assert!(!destination.exists());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_json_file_export_with_metadata() {
    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("export.json.gz");
    let store = tricky_store();
    let query = QueryRequest::new(42u64).with_filter_values("state", ["SP", "RJ"]);
    let metadata = JsonMetadata::new(chrono::Utc::now(), Some(query));
    let export = JsonExport::new(&store, 4, Some(metadata)).unwrap();
    let path = FileExport::create(export, &destination, Some(CompressionFormat::Gzip))
        .unwrap()
        .run_to_end(&store)
        .unwrap();

    let mut text = String::new();
    flate2::read::GzDecoder::new(std::fs::File::open(&path).unwrap())
        .read_to_string(&mut text)
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["metadata"]["row_count"], 11);
    assert_eq!(value["metadata"]["query"]["filters"]["state"], serde_json::json!(["SP", "RJ"]));
    let data = value["data"].as_array().unwrap();
    assert_eq!(data.len(), 11);
    assert_eq!(data[3]["id"], 3);
    assert_eq!(data[3]["amount"], 4.5);
    assert_eq!(data[10]["name"], "Rua \"A\", 12\nfundos");
    assert!(data[10]["amount"].is_null());
}

#[test]
fn test_json_export_without_metadata_is_a_plain_array() {
    let store = tricky_store();
    let mut export = JsonExport::new(&store, 3, None).unwrap();
    let mut text = String::new();
    while let Some(chunk) = export.next_chunk(&store) {
        text.push_str(&chunk.unwrap());
    }
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value.as_array().map(|rows| rows.len()), Some(11));
}
