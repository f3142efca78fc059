//! JSON shapes returned by the query service.
//!
//! Three result layouts are accepted:
//! `{"data": {"cols": [...], "rows": [[...]]}}`, the same table without the
//! `data` wrapper, and a bare array of row objects (older endpoints).

use crate::error::FetchError;
use crate::store::{CellValue, Column, ColumnType, ColumnarStore, Row};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct WireColumn {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub base_type: Option<String>,
}

impl WireColumn {
    pub fn into_column(self) -> Column {
        let column_type = self
            .base_type
            .as_deref()
            .map(ColumnType::from_base_type)
            .unwrap_or(ColumnType::Text);
        let display_name = self
            .display_name
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| self.name.clone());
        Column::new(self.name, column_type).with_display_name(display_name)
    }
}

#[derive(Debug, Deserialize)]
struct WireTable {
    #[serde(alias = "columns")]
    cols: Vec<WireColumn>,
    rows: Vec<Value>,
}

/// Convert one wire row. Arrays are positional; objects are matched to
/// `columns` by name with missing keys read as null.
pub fn decode_row(value: &Value, columns: &[Column]) -> Option<Row> {
    match value {
        Value::Array(cells) => Some(cells.iter().map(CellValue::from_json).collect()),
        Value::Object(map) => Some(
            columns
                .iter()
                .map(|c| map.get(&c.name).map(CellValue::from_json).unwrap_or_default())
                .collect(),
        ),
        _ => None,
    }
}

/// Decode a parsed response body into a populated store.
pub fn decode_result(body: &Value) -> Result<ColumnarStore, FetchError> {
    match body {
        Value::Object(map) => {
            let table = match map.get("data") {
                Some(data) if data.is_object() => data,
                _ => body,
            };
            let table = WireTable::deserialize(table)
                .map_err(|e| FetchError::InvalidResponse(format!("expected cols and rows: {}", e)))?;
            let columns: Vec<Column> = table.cols.into_iter().map(WireColumn::into_column).collect();
            let rows = table
                .rows
                .iter()
                .enumerate()
                .map(|(i, r)| match r {
                    Value::Array(_) => decode_row(r, &columns).ok_or(i),
                    _ => Err(i),
                })
                .collect::<Result<Vec<Row>, usize>>()
                .map_err(|i| FetchError::InvalidResponse(format!("row {} is not an array", i)))?;
            Ok(ColumnarStore::with_rows(columns, rows)?)
        }
        Value::Array(items) => decode_records(items),
        _ => Err(FetchError::InvalidResponse(
            "expected an object with cols and rows".to_string(),
        )),
    }
}

/// Array of row objects. Columns come from the first record's keys, types
/// are guessed from its values.
fn decode_records(items: &[Value]) -> Result<ColumnarStore, FetchError> {
    let records: Vec<&Map<String, Value>> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_object()
                .ok_or_else(|| FetchError::InvalidResponse(format!("record {} is not an object", i)))
        })
        .collect::<Result<_, _>>()?;

    let columns: Vec<Column> = records
        .first()
        .map(|first| {
            first
                .iter()
                .map(|(name, sample)| Column::new(name.clone(), ColumnType::guess(sample)))
                .collect()
        })
        .unwrap_or_default();

    let rows = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|c| record.get(&c.name).map(CellValue::from_json).unwrap_or_default())
                .collect()
        })
        .collect();
    Ok(ColumnarStore::with_rows(columns, rows)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use serde_json::json;

    #[test]
    fn test_wrapped_table() {
        let body = json!({"data": {
            "cols": [
                {"name": "id", "display_name": "ID", "base_type": "type/Integer"},
                {"name": "total", "base_type": "type/Decimal"}
            ],
            "rows": [[1, 10.5], [2, null]]
        }});
        let store = decode_result(&body).unwrap();
        assert_eq!(store.row_count(), 2);
        assert_eq!(store.column(0).unwrap().display_name, "ID");
        assert_eq!(store.column(1).unwrap().display_name, "total");
        assert_eq!(store.column(1).unwrap().column_type, ColumnType::Float);
        assert_eq!(store.row(1).unwrap()[1], CellValue::Null);
    }

    #[test]
    fn test_flat_table_with_columns_alias() {
        let body = json!({"columns": [{"name": "a"}], "rows": [["x"]]});
        let store = decode_result(&body).unwrap();
        assert_eq!(store.columns()[0].column_type, ColumnType::Text);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_wrong_shape_is_invalid_response() {
        assert!(matches!(
            decode_result(&json!({"data": {"rows": []}})),
            Err(FetchError::InvalidResponse(_))
        ));
        assert!(matches!(
            decode_result(&json!("hello")),
            Err(FetchError::InvalidResponse(_))
        ));
        assert!(matches!(
            decode_result(&json!({"cols": [{"name": "a"}], "rows": [5]})),
            Err(FetchError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_ragged_rows_are_schema_mismatch() {
        let body = json!({"cols": [{"name": "a"}, {"name": "b"}], "rows": [[1, 2], [3]]});
        assert_eq!(
            decode_result(&body).unwrap_err(),
            FetchError::SchemaMismatch(StoreError::SchemaMismatch {
                row: 1,
                expected: 2,
                found: 1
            })
        );
    }

    #[test]
    fn test_records_keep_key_order_and_guess_types() {
        let body = json!([
            {"name": "Ana", "age": 31, "since": "2020-02-01"},
            {"name": "Rui", "since": "2021-07-15"}
        ]);
        let store = decode_result(&body).unwrap();
        let names: Vec<&str> = store.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["name", "age", "since"]);
        assert_eq!(store.columns()[1].column_type, ColumnType::Integer);
        assert_eq!(store.columns()[2].column_type, ColumnType::Date);
        assert_eq!(store.row(1).unwrap()[1], CellValue::Null);
    }

    #[test]
    fn test_object_rows_follow_column_names() {
        let columns = vec![
            Column::new("a", ColumnType::Integer),
            Column::new("b", ColumnType::Text),
        ];
        let row = decode_row(&json!({"b": "x", "extra": 1}), &columns).unwrap();
        assert_eq!(row, vec![CellValue::Null, CellValue::from("x")]);
        assert!(decode_row(&json!(3), &columns).is_none());
    }
}
