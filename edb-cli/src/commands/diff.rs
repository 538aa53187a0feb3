use anyhow::Result;
use colored::Colorize;

use super::Store;
use crate::display::{format_timestamp, print_entry_diff};

pub fn run(store: &Store, first: i64, second: i64) -> Result<()> {
    let service = store.open()?;
    let diff = service.diff(first, second, store.stage())?;

    println!(
        "{} {} {} {}",
        "Diff from".bold().cyan(),
        format_timestamp(diff.start_timestamp()),
        "to".bold().cyan(),
        format_timestamp(diff.end_timestamp())
    );
    println!();

    if diff.difference_count() == 0 {
        println!("{}", "No differences".green());
        return Ok(());
    }

    for (oid, object) in &diff.object_diffs {
        println!("{}", "━".repeat(80).bright_black());

        let status = match (&object.start, &object.end) {
            (None, _) => "NEW".green(),
            (_, None) => "DEL".red(),
            _ => "MOD".yellow(),
        };
        println!("{} {}", status, oid.white().bold());
        println!();

        for (key, entry) in &object.entries {
            print_entry_diff(key, entry);
        }
        println!();
    }

    println!(
        "{} object(s) differ",
        diff.difference_count().to_string().cyan()
    );

    Ok(())
}
