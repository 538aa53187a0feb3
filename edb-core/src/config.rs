use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdbConfig {
    pub database: DatabaseConfig,
    /// Reject commits whose parent revision is not the current head.
    pub revision_check_enabled: bool,
    /// Install the conflict checker as the first pre-commit hook.
    pub conflict_checks: bool,
    /// Number of historical heads kept in memory; 0 disables the cache.
    pub head_cache_capacity: usize,
}

impl Default for EdbConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            revision_check_enabled: false,
            conflict_checks: true,
            head_cache_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; in-memory when unset.
    pub path: Option<PathBuf>,
}

impl EdbConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database.path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EdbConfig::from_toml_str("").unwrap();
        assert_eq!(config, EdbConfig::default());
        assert!(config.conflict_checks);
        assert!(!config.revision_check_enabled);
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_partial_config() {
        let config = EdbConfig::from_toml_str(
            r#"
            revision_check_enabled = true
            head_cache_capacity = 0

            [database]
            path = "store.db"
            "#,
        )
        .unwrap();

        assert!(config.revision_check_enabled);
        assert!(config.conflict_checks);
        assert_eq!(config.head_cache_capacity, 0);
        assert_eq!(config.database.path, Some(PathBuf::from("store.db")));
    }

    #[test]
    fn test_invalid_config() {
        let err = EdbConfig::from_toml_str("conflict_checks = \"yes\"").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "head_cache_capacity = 8").unwrap();

        let config = EdbConfig::from_file(file.path()).unwrap();
        assert_eq!(config.head_cache_capacity, 8);
    }
}
