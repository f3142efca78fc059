use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Saved question identifier: numeric id or name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuestionId {
    Number(u64),
    Name(String),
}

impl fmt::Display for QuestionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestionId::Number(n) => write!(f, "{}", n),
            QuestionId::Name(s) => f.write_str(s),
        }
    }
}

impl FromStr for QuestionId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.parse::<u64>() {
            Ok(n) => QuestionId::Number(n),
            Err(_) => QuestionId::Name(s.to_string()),
        })
    }
}

impl From<u64> for QuestionId {
    fn from(n: u64) -> Self {
        QuestionId::Number(n)
    }
}

impl From<&str> for QuestionId {
    fn from(s: &str) -> Self {
        QuestionId::Name(s.to_string())
    }
}

/// A question plus its filter set.
///
/// Every filter holds a list of values, even when it has one. Values are sent
/// as repeated query parameters and never joined into a single string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question_id: QuestionId,
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
}

impl QueryRequest {
    pub fn new(question_id: impl Into<QuestionId>) -> Self {
        Self {
            question_id: question_id.into(),
            filters: BTreeMap::new(),
        }
    }

    /// Add one value to a filter, keeping earlier values for the same key.
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_filter_values<I, V>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.filters
            .entry(key.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Parse `KEY=VALUE` filter arguments. Repeated keys accumulate.
    pub fn with_filter_args<S: AsRef<str>>(mut self, args: &[S]) -> Result<Self, String> {
        for arg in args {
            let (key, value) = parse_filter_arg(arg.as_ref())?;
            self = self.with_filter(key, value);
        }
        Ok(self)
    }

    /// Canonical key: question id plus filters sorted by name. Filters without
    /// values are left out since they produce the same request.
    pub fn cache_key(&self) -> String {
        let filters: BTreeMap<&str, &[String]> = self
            .filters
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(k, v)| (k.as_str(), v.as_slice()))
            .collect();
        serde_json::json!([self.question_id, filters]).to_string()
    }

    /// Query string pairs: `question_id` first, then one pair per filter value.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("question_id".to_string(), self.question_id.to_string())];
        for (key, values) in &self.filters {
            for value in values {
                pairs.push((key.clone(), value.clone()));
            }
        }
        pairs
    }
}

fn parse_filter_arg(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Invalid filter '{}'. Expected KEY=VALUE", arg)),
    }
}

/// Join `path` onto `base` with exactly one slash between them.
pub fn endpoint_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if base.is_empty() {
        format!("/{}", path)
    } else {
        format!("{}/{}", base, path)
    }
}
