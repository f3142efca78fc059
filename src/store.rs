//! Row-major result storage.
//!
//! A [`ColumnarStore`] holds one query result: a fixed list of columns and an
//! append-only sequence of rows. Rows are never reordered or removed while a
//! result is being ingested, so a row index read once stays valid.

use crate::error::StoreError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Date,
    DateTime,
    Boolean,
}

impl ColumnType {
    /// Map a query service base type (`type/Integer`, `type/DateTimeWithTZ`, ...).
    pub fn from_base_type(base_type: &str) -> Self {
        match base_type.trim().trim_start_matches("type/") {
            "Integer" | "BigInteger" => ColumnType::Integer,
            "Float" | "Decimal" | "Currency" | "Number" => ColumnType::Float,
            "Date" => ColumnType::Date,
            "DateTime" | "DateTimeWithTZ" | "DateTimeWithLocalTZ" | "Time" => {
                ColumnType::DateTime
            }
            "Boolean" => ColumnType::Boolean,
            _ => ColumnType::Text,
        }
    }

    /// Guess a type from a sample JSON value (used for responses without column metadata).
    pub fn guess(value: &Value) -> Self {
        match value {
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Integer,
            Value::Number(_) => ColumnType::Float,
            Value::String(s) => {
                if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
                    ColumnType::Date
                } else if parse_datetime(s).is_some() {
                    ColumnType::DateTime
                } else {
                    ColumnType::Text
                }
            }
            _ => ColumnType::Text,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }

    pub fn name(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
            ColumnType::Boolean => "boolean",
        }
    }
}

/// Parse the ISO-8601 datetime shapes the query service emits.
pub(crate) fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub display_name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            column_type,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

/// A single scalar cell. Dates and datetimes are kept as the text the server sent.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl CellValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Boolean(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => CellValue::Integer(i),
                None => n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Null),
            },
            Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(i) => Some(*i as f64),
            CellValue::Float(f) => Some(*f),
            CellValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// JSON form of the cell. Non-finite floats have no JSON number and
    /// become null.
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Integer(i) => Value::from(*i),
            CellValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Text(s) => Value::String(s.clone()),
            CellValue::Boolean(b) => Value::Bool(*b),
        }
    }

    fn heap_bytes(&self) -> usize {
        match self {
            CellValue::Text(s) => s.capacity(),
            _ => 0,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => Ok(()),
            CellValue::Integer(i) => write!(f, "{}", i),
            CellValue::Float(v) if v.is_infinite() => {
                f.write_str(if *v > 0.0 { "Infinity" } else { "-Infinity" })
            }
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl From<i64> for CellValue {
    fn from(i: i64) -> Self {
        CellValue::Integer(i)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Boolean(b)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(CellValue::Null)
    }
}

pub type Row = Vec<CellValue>;

#[derive(Debug, Clone, Default)]
pub struct ColumnarStore {
    columns: Vec<Column>,
    initialized: bool,
    rows: Vec<Row>,
}

impl ColumnarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a schema and an initial batch of rows.
    pub fn with_rows(columns: Vec<Column>, rows: Vec<Row>) -> Result<Self, StoreError> {
        let mut store = Self::new();
        store.init(columns)?;
        store.append_rows(rows)?;
        Ok(store)
    }

    /// Set the schema. Fails if a schema is already set and the store was not reset.
    pub fn init(&mut self, columns: Vec<Column>) -> Result<(), StoreError> {
        if self.initialized {
            return Err(StoreError::AlreadyInitialized);
        }
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(StoreError::DuplicateColumn(column.name.clone()));
            }
        }
        self.columns = columns;
        self.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Append a batch. Either every row is appended or none is.
    pub fn append_rows(&mut self, rows: Vec<Row>) -> Result<(), StoreError> {
        if !self.initialized {
            return Err(StoreError::NotInitialized);
        }
        let expected = self.columns.len();
        if let Some((offset, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != expected) {
            return Err(StoreError::SchemaMismatch {
                row: self.rows.len() + offset,
                expected,
                found: row.len(),
            });
        }
        self.rows.reserve(rows.len());
        self.rows.extend(rows);
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Rows in `range`, clamped to the rows that exist.
    pub fn rows(&self, range: Range<usize>) -> &[Row] {
        let end = range.end.min(self.rows.len());
        let start = range.start.min(end);
        &self.rows[start..end]
    }

    /// Drop rows and schema and give the memory back.
    pub fn reset(&mut self) {
        self.rows = Vec::new();
        self.columns = Vec::new();
        self.initialized = false;
    }

    /// Rough in-memory footprint of the rows and column metadata.
    pub fn estimated_size_bytes(&self) -> usize {
        let cell = std::mem::size_of::<CellValue>();
        let row = std::mem::size_of::<Row>();
        let columns: usize = self
            .columns
            .iter()
            .map(|c| std::mem::size_of::<Column>() + c.name.capacity() + c.display_name.capacity())
            .sum();
        let rows: usize = self
            .rows
            .iter()
            .map(|r| row + r.capacity() * cell + r.iter().map(CellValue::heap_bytes).sum::<usize>())
            .sum();
        columns + rows + (self.rows.capacity() - self.rows.len()) * row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnType::Integer),
            Column::new("name", ColumnType::Text),
            Column::new("amount", ColumnType::Float),
        ]
    }

    #[test]
    fn test_init_twice_requires_reset() {
        let mut store = ColumnarStore::new();
        store.init(three_columns()).unwrap();
        assert_eq!(
            store.init(three_columns()),
            Err(StoreError::AlreadyInitialized)
        );
        store.reset();
        store
            .init(vec![Column::new("only", ColumnType::Text)])
            .unwrap();
        assert_eq!(store.column_count(), 1);
    }

    #[test]
    fn test_duplicate_column_names_rejected() {
        let mut store = ColumnarStore::new();
        let err = store
            .init(vec![
                Column::new("a", ColumnType::Text),
                Column::new("a", ColumnType::Integer),
            ])
            .unwrap_err();
        assert_eq!(err, StoreError::DuplicateColumn("a".to_string()));
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_append_requires_schema() {
        let mut store = ColumnarStore::new();
        assert_eq!(
            store.append_rows(vec![vec![CellValue::Null]]),
            Err(StoreError::NotInitialized)
        );
    }

    #[test]
    fn test_narrow_row_rejected_without_side_effects() {
        let mut store = ColumnarStore::new();
        store.init(three_columns()).unwrap();
        store
            .append_rows(vec![vec![1i64.into(), "a".into(), 1.5.into()]])
            .unwrap();

        let err = store
            .append_rows(vec![
                vec![2i64.into(), "b".into(), 2.5.into()],
                vec![1i64.into(), 2i64.into()],
            ])
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::SchemaMismatch {
                row: 2,
                expected: 3,
                found: 2
            }
        );
        assert_eq!(store.row_count(), 1);
        assert_eq!(store.row(0).unwrap()[1], CellValue::from("a"));
    }

    #[test]
    fn test_rows_are_append_only() {
        let mut store = ColumnarStore::new();
        store.init(vec![Column::new("n", ColumnType::Integer)]).unwrap();
        let mut last_count = 0;
        for batch in 0..5i64 {
            let rows = (0..10).map(|i| vec![CellValue::Integer(batch * 10 + i)]).collect();
            store.append_rows(rows).unwrap();
            assert!(store.row_count() > last_count);
            last_count = store.row_count();
            for i in 0..store.row_count() {
                assert_eq!(store.row(i).unwrap()[0], CellValue::Integer(i as i64));
            }
        }
    }

    #[test]
    fn test_rows_range_is_clamped() {
        let store = ColumnarStore::with_rows(
            vec![Column::new("n", ColumnType::Integer)],
            (0..5).map(|i| vec![CellValue::Integer(i)]).collect(),
        )
        .unwrap();
        assert_eq!(store.rows(3..100).len(), 2);
        assert!(store.rows(10..20).is_empty());
    }

    #[test]
    fn test_reset_releases_rows() {
        let mut store = ColumnarStore::with_rows(
            three_columns(),
            vec![vec![1i64.into(), "x".into(), CellValue::Null]],
        )
        .unwrap();
        assert!(store.estimated_size_bytes() > 0);
        store.reset();
        assert_eq!(store.row_count(), 0);
        assert_eq!(store.column_count(), 0);
        assert!(!store.is_initialized());
    }

    #[test]
    fn test_base_type_mapping() {
        assert_eq!(ColumnType::from_base_type("type/BigInteger"), ColumnType::Integer);
        assert_eq!(ColumnType::from_base_type("type/Currency"), ColumnType::Float);
        assert_eq!(ColumnType::from_base_type("type/DateTimeWithTZ"), ColumnType::DateTime);
        assert_eq!(ColumnType::from_base_type("type/Date"), ColumnType::Date);
        assert_eq!(ColumnType::from_base_type("type/Text"), ColumnType::Text);
        assert_eq!(ColumnType::from_base_type("type/UUID"), ColumnType::Text);
    }

    #[test]
    fn test_guess_type_from_sample() {
        assert_eq!(ColumnType::guess(&serde_json::json!(3)), ColumnType::Integer);
        assert_eq!(ColumnType::guess(&serde_json::json!(3.25)), ColumnType::Float);
        assert_eq!(ColumnType::guess(&serde_json::json!(true)), ColumnType::Boolean);
        assert_eq!(ColumnType::guess(&serde_json::json!("2024-01-31")), ColumnType::Date);
        assert_eq!(
            ColumnType::guess(&serde_json::json!("2024-01-31T10:20:30Z")),
            ColumnType::DateTime
        );
        assert_eq!(ColumnType::guess(&serde_json::json!("north")), ColumnType::Text);
    }

    #[test]
    fn test_cell_display_matches_plain_string_conversion() {
        assert_eq!(CellValue::Null.to_string(), "");
        assert_eq!(CellValue::Float(2.5).to_string(), "2.5");
        assert_eq!(CellValue::Float(2.0).to_string(), "2");
        assert_eq!(CellValue::Integer(-7).to_string(), "-7");
        assert_eq!(CellValue::Boolean(false).to_string(), "false");
        assert_eq!(CellValue::from_json(&serde_json::json!(12)), CellValue::Integer(12));
        assert_eq!(
            CellValue::from_json(&serde_json::json!([1, 2])),
            CellValue::Text("[1,2]".to_string())
        );
    }
}
