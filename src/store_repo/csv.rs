// Annotated-CSV query responses -> rows.
// Tables are separated by blank lines and each starts with its own header row; annotation
// rows start with '#'. The first column is the (empty) annotation column and is dropped.

use std::collections::BTreeMap;

use ::csv::{ReaderBuilder, StringRecord};

use crate::error::StoreError;
use crate::models::QueryRow;

fn format_error(e: ::csv::Error) -> StoreError {
    StoreError::Format(e.to_string())
}

/// Consecutive non-blank lines of the response, one entry per result table.
fn tables(body: &str) -> Vec<String> {
    let mut tables = Vec::new();
    let mut current = String::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            if !current.is_empty() {
                tables.push(std::mem::take(&mut current));
            }
            continue;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.is_empty() {
        tables.push(current);
    }
    tables
}

fn to_row(header: &StringRecord, record: &StringRecord) -> QueryRow {
    let row: BTreeMap<String, String> = header
        .iter()
        .zip(record.iter())
        .filter(|(c, _)| !c.is_empty())
        .map(|(c, v)| (c.to_string(), v.to_string()))
        .collect();
    QueryRow(row)
}

pub fn parse_query_csv(body: &str) -> Result<Vec<QueryRow>, StoreError> {
    let mut rows = Vec::new();
    for table in tables(body) {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_reader(table.as_bytes());
        let mut records = reader.records();
        let Some(header) = records.next().transpose().map_err(format_error)? else {
            continue;
        };
        for record in records {
            let record = record.map_err(format_error)?;
            if record.len() != header.len() {
                return Err(StoreError::Format(format!(
                    "query row has {} fields, header has {}",
                    record.len(),
                    header.len()
                )));
            }
            rows.push(to_row(&header, &record));
        }
    }
    Ok(rows)
}
