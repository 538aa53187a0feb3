use anyhow::{Context, Result};
use colored::Colorize;
use edb_core::{Error, Record, Value};
use serde::Deserialize;
use std::path::PathBuf;

use super::Store;
use crate::display::format_timestamp;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Batch {
    comment: Option<String>,
    stage: Option<String>,
    inserts: Vec<BatchObject>,
    updates: Vec<BatchObject>,
    deletions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchObject {
    oid: String,
    #[serde(default)]
    entries: serde_json::Map<String, serde_json::Value>,
}

impl BatchObject {
    fn into_record(self) -> Result<Record> {
        let mut record = Record::new(self.oid);
        for (key, value) in self.entries {
            let value = Value::from_json(&value)
                .with_context(|| format!("Invalid value for {} of {}", key, record.oid))?;
            record.put(key, value);
        }
        Ok(record)
    }
}

fn records(objects: Vec<BatchObject>) -> Result<Vec<Record>> {
    objects.into_iter().map(BatchObject::into_record).collect()
}

pub fn run(store: &Store, batch_path: PathBuf, agent: String) -> Result<()> {
    let text = std::fs::read_to_string(&batch_path)
        .with_context(|| format!("Failed to read {}", batch_path.display()))?;
    let batch: Batch = serde_json::from_str(&text).context("Invalid batch file")?;

    let service = store.open_as(&agent)?;
    let stage = batch.stage.as_deref().or(store.stage());

    let mut commit = service.create_commit(
        stage,
        records(batch.inserts)?,
        records(batch.updates)?,
        batch.deletions,
    )?;
    commit.comment = batch.comment;

    if commit.is_empty() {
        println!("{}", "Nothing to commit".yellow());
        return Ok(());
    }

    match service.commit(&mut commit) {
        Ok(timestamp) => {
            println!("{}", "✓ Commit created".green().bold());
            println!("  {}: {}", "Revision".bold(), commit.revision);
            println!("  {}: {}", "Date".bold(), format_timestamp(timestamp));
            println!(
                "  {}: {} inserted, {} updated, {} deleted",
                "Changes".bold(),
                commit.inserts.len().to_string().cyan(),
                commit.updates.len().to_string().cyan(),
                commit.deletions.len().to_string().cyan()
            );
            Ok(())
        }
        Err(Error::Conflict(report)) => {
            println!("{}", "✗ Commit rejected".red().bold());
            for record in &report.failed_inserts {
                println!("  {} {}", "exists".red(), record.oid);
            }
            for record in &report.failed_updates {
                println!("  {} {}", "conflict".red(), record.oid);
            }
            for oid in &report.failed_deletes {
                println!("  {} {}", "missing".red(), oid);
            }
            anyhow::bail!("{}", report)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_batch() {
        let batch: Batch = serde_json::from_str(
            r#"{
                "comment": "initial import",
                "inserts": [{"oid": "a", "entries": {"name": "foo", "size": 3, "ok": true}}],
                "deletions": ["b"]
            }"#,
        )
        .unwrap();

        assert_eq!(batch.comment.as_deref(), Some("initial import"));
        assert!(batch.updates.is_empty());
        assert_eq!(batch.deletions, vec!["b"]);

        let inserts = records(batch.inserts).unwrap();
        assert_eq!(inserts[0].get("size"), Some(&Value::Int(3)));
        assert_eq!(inserts[0].get("ok"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_nested_values_are_rejected() {
        let batch: Batch =
            serde_json::from_str(r#"{"inserts": [{"oid": "a", "entries": {"tags": ["x"]}}]}"#)
                .unwrap();

        assert!(records(batch.inserts).is_err());
    }

    #[test]
    fn test_commit_batch_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store {
            db: Some(dir.path().join("edb.db")),
            config: None,
            stage: None,
        };
        crate::commands::init::run(&store).unwrap();

        let batch = dir.path().join("batch.json");
        std::fs::write(&batch, r#"{"inserts": [{"oid": "a", "entries": {"name": "foo"}}]}"#)
            .unwrap();
        run(&store, batch.clone(), "tester".to_string()).unwrap();

        let service = store.open().unwrap();
        let record = service.get_object("a").unwrap();
        assert_eq!(record.get("name").unwrap().as_str(), Some("foo"));
        assert!(run(&store, batch, "tester".to_string()).is_err());
    }
}
