use anyhow::Result;
use colored::Colorize;
use edb_core::CommitFilter;

use super::Store;
use crate::display::print_commit_header;

pub fn run(store: &Store, limit: Option<usize>) -> Result<()> {
    let service = store.open()?;
    let mut commits = service.get_commits_matching(&CommitFilter::new().stage(store.stage()))?;
    commits.reverse();

    if commits.is_empty() {
        println!("{}", "No commits yet".yellow());
        return Ok(());
    }

    println!("{}", "Commit History".bold().cyan());
    println!();

    let to_show = limit.unwrap_or(commits.len()).min(commits.len());

    for commit in commits.iter().take(to_show) {
        print_commit_header(commit);
        println!();
        println!(
            "    {} inserted, {} updated, {} deleted",
            commit.inserts.len().to_string().cyan(),
            commit.updates.len().to_string().cyan(),
            commit.deletions.len().to_string().cyan()
        );

        let oids: Vec<&str> = commit
            .objects()
            .map(|r| r.oid.as_str())
            .chain(commit.deletions.iter().map(String::as_str))
            .collect();
        for oid in oids.iter().take(5) {
            println!("      • {}", oid.dimmed());
        }
        if oids.len() > 5 {
            println!(
                "      {} and {} more...",
                "...".dimmed(),
                (oids.len() - 5).to_string().dimmed()
            );
        }

        println!();
    }

    if commits.len() > to_show {
        println!(
            "{}",
            format!("... and {} more commits", commits.len() - to_show).dimmed()
        );
        println!("Use {} to see more", "--limit N".cyan());
    }

    Ok(())
}
