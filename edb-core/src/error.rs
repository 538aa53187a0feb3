use crate::models::Record;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Commit {0} is already committed")]
    AlreadyCommitted(Uuid),

    #[error("Commit was built against revision {}, but the current head is {}", fmt_revision(.expected), fmt_revision(.actual))]
    StaleHead {
        expected: Option<Uuid>,
        actual: Option<Uuid>,
    },

    #[error("{0}")]
    Conflict(Box<ConflictReport>),

    #[error("No head exists at or before timestamp {0}")]
    HeadNotFound(i64),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Failed to persist commit: {0}")]
    Persistence(#[source] Box<Error>),

    #[error("Object {oid} already has a version at timestamp {timestamp}")]
    DuplicateVersion { oid: String, timestamp: i64 },

    #[error("Inconsistent log: {commits} commits for {history} history entries")]
    InconsistentLog { commits: usize, history: usize },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl Error {
    /// Domain conflicts are always surfaced to the caller of a commit.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_) | Error::StaleHead { .. } | Error::AlreadyCommitted(_)
        )
    }

    pub fn conflict_report(&self) -> Option<&ConflictReport> {
        match self {
            Error::Conflict(report) => Some(report),
            _ => None,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned
    }
}

fn fmt_revision(revision: &Option<Uuid>) -> String {
    revision
        .map(|r| r.to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

/// Every violation found while checking one commit.
#[derive(Debug, Clone, Default)]
pub struct ConflictReport {
    pub failed_inserts: Vec<Record>,
    pub failed_updates: Vec<Record>,
    pub failed_deletes: Vec<String>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.failed_inserts.is_empty()
            && self.failed_updates.is_empty()
            && self.failed_deletes.is_empty()
    }

    pub fn failed_update_oids(&self) -> Vec<&str> {
        self.failed_updates.iter().map(|r| r.oid.as_str()).collect()
    }

    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Conflict(Box::new(self)))
        }
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut messages = Vec::new();
        for insert in &self.failed_inserts {
            messages.push(format!("Object with the oid {} exists already.", insert.oid));
        }
        for update in &self.failed_updates {
            messages.push(format!("Found a conflict for the oid {}.", update.oid));
        }
        for oid in &self.failed_deletes {
            messages.push(format!(
                "Object with the oid {} doesn't exist or is deleted.",
                oid
            ));
        }
        write!(f, "{}", messages.join(" "))
    }
}

/// Failure raised by a commit hook.
#[derive(Error, Debug)]
pub enum HookError {
    /// The service behind the hook is temporarily absent; always ignored.
    #[error("Hook service unavailable")]
    Unavailable,

    /// The hook's own domain error; this one changes the outcome of a commit.
    #[error(transparent)]
    Edb(#[from] Error),

    /// Anything else a hook ran into; logged and suppressed.
    #[error("Hook fault: {0}")]
    Fault(#[source] anyhow::Error),
}

pub type HookResult<T> = std::result::Result<T, HookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_classification() {
        assert!(Error::AlreadyCommitted(Uuid::new_v4()).is_domain());
        assert!(Error::StaleHead {
            expected: None,
            actual: Some(Uuid::new_v4())
        }
        .is_domain());
        assert!(Error::Conflict(Box::default()).is_domain());
        assert!(!Error::HeadNotFound(3).is_domain());
        assert!(!Error::ObjectNotFound("a".to_string()).is_domain());
    }

    #[test]
    fn test_conflict_report_message() {
        let report = ConflictReport {
            failed_inserts: vec![Record::new("a")],
            failed_updates: vec![Record::new("b")],
            failed_deletes: vec!["c".to_string()],
        };

        let message = report.to_string();
        assert!(message.contains("oid a exists already"));
        assert!(message.contains("conflict for the oid b"));
        assert!(message.contains("oid c doesn't exist"));
        assert_eq!(report.failed_update_oids(), vec!["b"]);
    }

    #[test]
    fn test_empty_report_is_ok() {
        assert!(ConflictReport::default().into_result().is_ok());
    }
}
