// One time-series point plus its line-protocol rendering, and rows returned by queries.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    /// Tag order is preserved in the rendered line.
    pub tags: Vec<(String, String)>,
    pub field: String,
    pub value: f64,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, field: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            field: field.into(),
            value,
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Line protocol with second precision: `measurement,tag=v field=value ts`.
    pub fn to_line_protocol(&self) -> Result<String, StoreError> {
        if self.measurement.is_empty() || self.field.is_empty() {
            return Err(StoreError::Format(
                "point needs a measurement and a field".into(),
            ));
        }
        if !self.value.is_finite() {
            return Err(StoreError::Format(format!(
                "non-finite value {} for {}",
                self.value, self.measurement
            )));
        }
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (k, v) in &self.tags {
            if v.is_empty() {
                continue;
            }
            let _ = write!(
                line,
                ",{}={}",
                escape(k, &[',', '=', ' ']),
                escape(v, &[',', '=', ' '])
            );
        }
        let _ = write!(
            line,
            " {}={} {}",
            escape(&self.field, &[',', '=', ' ']),
            self.value,
            self.timestamp
        );
        Ok(line)
    }
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// One record of a query result, column name -> raw text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRow(pub BTreeMap<String, String>);

impl QueryRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.get(column)?.trim().parse().ok()
    }

    pub fn value(&self) -> Option<f64> {
        self.get_f64("_value")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        QueryRow(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
