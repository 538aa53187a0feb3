pub mod commit;
pub mod diff;
pub mod head;
pub mod history;
pub mod init;
pub mod log;
pub mod query;
pub mod show;

use anyhow::{Context, Result};
use edb_core::{EdbConfig, EdbService, StaticIdentity};
use std::path::PathBuf;

/// Location and settings of the store a command works on.
pub struct Store {
    pub db: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub stage: Option<String>,
}

impl Store {
    pub fn db_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.db {
            return Ok(path.clone());
        }
        if let Some(path) = self.load_config()?.database.path {
            return Ok(path);
        }
        get_db_path(None)
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    fn load_config(&self) -> Result<EdbConfig> {
        match &self.config {
            Some(path) => EdbConfig::from_file(path)
                .with_context(|| format!("Failed to read config {}", path.display())),
            None => Ok(EdbConfig::default()),
        }
    }

    /// Opens an existing store, committing as `committer`.
    pub fn open_as(&self, committer: &str) -> Result<EdbService> {
        let db_path = self.db_path()?;
        if !db_path.exists() {
            anyhow::bail!(
                "No store found at {}. Run 'edb init' first.",
                db_path.display()
            );
        }

        let config = self.load_config()?.with_database_path(db_path);
        let identity = StaticIdentity::new(committer, "edb-cli");
        EdbService::open(&config, identity).context("Failed to open store")
    }

    pub fn open(&self) -> Result<EdbService> {
        self.open_as("cli-user")
    }
}

pub fn get_db_path(custom_path: Option<PathBuf>) -> Result<PathBuf> {
    match custom_path {
        Some(path) => Ok(path),
        None => Ok(std::env::current_dir()?.join(".edb").join("edb.db")),
    }
}
