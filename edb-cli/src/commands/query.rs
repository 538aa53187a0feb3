use anyhow::Result;
use colored::Colorize;
use edb_core::{QueryRequest, Value};

use super::Store;
use crate::display::print_record;

/// Parses `key=value`; values that read as JSON scalars keep their type.
fn parse_predicate(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        anyhow::bail!("Expected key=value, got '{}'", raw);
    };
    let value = serde_json::from_str::<serde_json::Value>(value)
        .ok()
        .and_then(|json| Value::from_json(&json).ok())
        .unwrap_or_else(|| Value::from(value));
    Ok((key.to_string(), value))
}

pub fn run(
    store: &Store,
    predicates: &[String],
    at: Option<i64>,
    ignore_case: bool,
    like: bool,
) -> Result<()> {
    let mut request = QueryRequest::new();
    for raw in predicates {
        let (key, value) = parse_predicate(raw)?;
        request = request.and(key, value);
    }
    request.timestamp = at;
    request.stage_id = store.stage.clone();
    request.case_sensitive = !ignore_case;
    request.wildcard_aware = like;

    let service = store.open()?;
    let records = service.query(&request)?;

    if records.is_empty() {
        println!("{}", "No matching objects".yellow());
        return Ok(());
    }

    for record in &records {
        print_record(record);
    }
    println!();
    println!("{} match(es)", records.len().to_string().cyan());

    Ok(())
}
