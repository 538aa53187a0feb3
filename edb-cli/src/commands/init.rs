use anyhow::{Context, Result};
use colored::Colorize;
use edb_core::SqliteRepository;

use super::Store;

pub fn run(store: &Store) -> Result<()> {
    let db_path = store.db_path()?;

    if db_path.exists() {
        println!(
            "{} {}",
            "Store already initialized at".yellow(),
            db_path.display()
        );
        return Ok(());
    }

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    SqliteRepository::new(&db_path).context("Failed to create store")?;

    println!("{}", "✓ Initialized empty store".green().bold());
    println!("  {}: {}", "Database".bold(), db_path.display());

    Ok(())
}
