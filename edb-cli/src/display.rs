use chrono::{DateTime, Utc};
use colored::Colorize;
use edb_core::diff::{DiffLineType, EntryDiff};
use edb_core::{Commit, Record, Value};

pub fn format_timestamp(millis: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(time) => format!("{} ({})", time.format("%Y-%m-%d %H:%M:%S%.3f"), millis),
        None => millis.to_string(),
    }
}

pub fn format_value(value: &Value) -> String {
    format!("{} {}", value, format!("[{}]", value.type_tag()).dimmed())
}

pub fn print_commit_header(commit: &Commit) {
    println!(
        "{} {}",
        "commit".yellow().bold(),
        commit.revision.to_string().yellow()
    );
    println!("{}: {}", "Committer".bold(), commit.committer);
    if let Some(timestamp) = commit.timestamp {
        println!("{}: {}", "Date".bold(), format_timestamp(timestamp));
    }
    if let Some(stage) = &commit.stage_id {
        println!("{}: {}", "Stage".bold(), stage);
    }
    if let Some(comment) = &commit.comment {
        println!();
        println!("    {}", comment);
    }
}

pub fn print_record(record: &Record) {
    let status = if record.deleted {
        "deleted".red()
    } else {
        "live".green()
    };
    println!(
        "{} {} {}",
        record.oid.white().bold(),
        status,
        format_timestamp(record.timestamp).dimmed()
    );
    for (key, value) in &record.entries {
        println!("    {}: {}", key.cyan(), format_value(value));
    }
}

pub fn print_entry_diff(key: &str, entry: &EntryDiff) {
    let is_text = |v: &Option<Value>| v.as_ref().map_or(true, |v| v.as_str().is_some());
    if is_text(&entry.before) && is_text(&entry.after) {
        println!("  {}", key.cyan());
        for line in entry.render_text() {
            let (prefix, color): (&str, fn(&str) -> colored::ColoredString) = match line.line_type
            {
                DiffLineType::Addition => ("+", |s| s.green()),
                DiffLineType::Deletion => ("-", |s| s.red()),
                DiffLineType::Context => (" ", |s| s.normal()),
            };
            println!("    {}", color(&format!("{}{}", prefix, line.content.trim_end())));
        }
        return;
    }

    let show = |v: &Option<Value>| v.as_ref().map_or("<absent>".to_string(), format_value);
    println!(
        "  {}: {} -> {}",
        key.cyan(),
        show(&entry.before).red(),
        show(&entry.after).green()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00.000 (0)");
        assert_eq!(format_timestamp(i64::MAX), i64::MAX.to_string());
    }
}
