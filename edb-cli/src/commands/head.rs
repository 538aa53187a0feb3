use anyhow::Result;
use colored::Colorize;
use edb_core::Error;

use super::Store;
use crate::display::format_timestamp;

pub fn run(store: &Store, at: Option<i64>) -> Result<()> {
    let service = store.open()?;

    let head = match at {
        Some(timestamp) => service.head_at(timestamp, store.stage()),
        None => service.head(store.stage()),
    };
    let head = match head {
        Ok(head) => head,
        Err(Error::HeadNotFound(_)) => {
            println!("{}", "No commits yet".yellow());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "{} {}",
        "Head at".bold().cyan(),
        format_timestamp(head.timestamp)
    );
    println!();

    for record in head.records() {
        println!(
            "  {} {} {}",
            record.oid.white().bold(),
            format!("v{}", record.model_version()?.unwrap_or(0)).cyan(),
            format!("{} field(s)", record.entries.len()).dimmed()
        );
    }

    println!();
    println!("{} live object(s)", head.len().to_string().cyan());

    Ok(())
}
