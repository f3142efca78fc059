//! Cell formatting strategies.
//!
//! A [`FormatStrategy`] picks one formatter per column when a schema is
//! known; rendering and export then call the resolved formatter for each
//! cell without looking at types again.

use crate::store::{parse_datetime, CellValue, Column, ColumnType, Row};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type CellFormatter = Box<dyn Fn(&CellValue) -> String + Send + Sync>;

pub trait FormatStrategy: Send + Sync {
    fn formatter_for(&self, column: &Column) -> CellFormatter;
}

/// `value.to_string()` for every cell; nulls become empty strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormat;

impl FormatStrategy for PlainFormat {
    fn formatter_for(&self, _column: &Column) -> CellFormatter {
        Box::new(|value| value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NumberLocale {
    #[default]
    Plain,
    PtBr,
    EnUs,
}

impl NumberLocale {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().replace('_', "-").as_str() {
            "plain" | "" => Some(NumberLocale::Plain),
            "pt-br" => Some(NumberLocale::PtBr),
            "en-us" => Some(NumberLocale::EnUs),
            _ => None,
        }
    }

    /// (thousands separator, decimal separator)
    fn separators(self) -> (Option<char>, char) {
        match self {
            NumberLocale::Plain => (None, '.'),
            NumberLocale::PtBr => (Some('.'), ','),
            NumberLocale::EnUs => (Some(','), '.'),
        }
    }
}

/// Locale-aware numbers and reformatted dates.
#[derive(Debug, Clone, PartialEq)]
pub struct LocaleFormat {
    pub locale: NumberLocale,
    pub max_fraction_digits: usize,
    pub date_format: String,
    pub datetime_format: String,
}

impl Default for LocaleFormat {
    fn default() -> Self {
        Self {
            locale: NumberLocale::PtBr,
            max_fraction_digits: 2,
            date_format: "%d/%m/%Y".to_string(),
            datetime_format: "%d/%m/%Y %H:%M:%S".to_string(),
        }
    }
}

impl FormatStrategy for LocaleFormat {
    fn formatter_for(&self, column: &Column) -> CellFormatter {
        let locale = self.locale;
        let digits = self.max_fraction_digits;
        match column.column_type {
            ColumnType::Integer | ColumnType::Float => Box::new(move |value| match value {
                CellValue::Integer(i) => format_number(*i as f64, 0, locale),
                CellValue::Float(f) => format_number(*f, digits, locale),
                other => other.to_string(),
            }),
            ColumnType::Date => {
                let fmt = self.date_format.clone();
                Box::new(move |value| match value {
                    CellValue::Text(s) => parse_date(s)
                        .map(|d| d.format(&fmt).to_string())
                        .unwrap_or_else(|| s.clone()),
                    other => other.to_string(),
                })
            }
            ColumnType::DateTime => {
                let fmt = self.datetime_format.clone();
                Box::new(move |value| match value {
                    CellValue::Text(s) => parse_datetime(s)
                        .map(|d| d.format(&fmt).to_string())
                        .unwrap_or_else(|| s.clone()),
                    other => other.to_string(),
                })
            }
            ColumnType::Text | ColumnType::Boolean => Box::new(|value| value.to_string()),
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|dt| dt.date()))
}

/// Round to at most `max_fraction_digits`, drop trailing zeros, group thousands.
pub fn format_number(value: f64, max_fraction_digits: usize, locale: NumberLocale) -> String {
    if !value.is_finite() {
        return CellValue::Float(value).to_string();
    }
    let (thousands, decimal) = locale.separators();
    let fixed = format!("{:.*}", max_fraction_digits, value.abs());
    let (int_part, frac_part) = match fixed.split_once('.') {
        Some((i, f)) => (i, f.trim_end_matches('0')),
        None => (fixed.as_str(), ""),
    };

    let mut out = String::with_capacity(fixed.len() + fixed.len() / 3 + 2);
    let negative = value < 0.0 && (int_part.bytes().any(|b| b != b'0') || !frac_part.is_empty());
    if negative {
        out.push('-');
    }
    let len = int_part.len();
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            if let Some(sep) = thousands {
                out.push(sep);
            }
        }
        out.push(ch);
    }
    if !frac_part.is_empty() {
        out.push(decimal);
        out.push_str(frac_part);
    }
    out
}

/// Formatters resolved for one schema, indexed by column position.
#[derive(Clone)]
pub struct ColumnFormatters {
    formatters: Arc<Vec<CellFormatter>>,
}

impl ColumnFormatters {
    pub fn resolve(columns: &[Column], strategy: &dyn FormatStrategy) -> Self {
        Self {
            formatters: Arc::new(columns.iter().map(|c| strategy.formatter_for(c)).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.formatters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formatters.is_empty()
    }

    pub fn format(&self, column: usize, value: &CellValue) -> String {
        match self.formatters.get(column) {
            Some(f) => f(value),
            None => value.to_string(),
        }
    }

    pub fn format_row(&self, row: &Row) -> Vec<String> {
        row.iter()
            .enumerate()
            .map(|(i, value)| self.format(i, value))
            .collect()
    }
}

impl std::fmt::Debug for ColumnFormatters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFormatters")
            .field("columns", &self.formatters.len())
            .finish()
    }
}
