use anyhow::Result;
use colored::Colorize;

use super::Store;
use crate::display::{format_timestamp, print_record};

pub fn run(store: &Store, oid: &str) -> Result<()> {
    let service = store.open()?;
    let log = service.get_log(oid, i64::MIN, i64::MAX, store.stage())?;

    if log.is_empty() {
        println!("{} {}", "No history for".yellow(), oid.bold());
        return Ok(());
    }

    println!("{} {}", "History of".bold().cyan(), oid.bold());
    println!();

    for entry in &log {
        println!("{}", "━".repeat(80).bright_black());
        println!(
            "{} {} by {}",
            entry.commit.revision.to_string().yellow(),
            format_timestamp(entry.record.timestamp).dimmed(),
            entry.commit.committer
        );
        if let Some(comment) = &entry.commit.comment {
            println!("    {}", comment);
        }
        print_record(&entry.record);
    }

    println!();
    println!("{} version(s)", log.len().to_string().cyan());

    Ok(())
}
