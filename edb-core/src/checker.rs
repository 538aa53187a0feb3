//! The standard pre-commit hook: rejects inserts of live objects, deletes of
//! missing objects and conflicting updates, and assigns model versions.
//!
//! An update whose `modelVersion` is stale is still accepted when every
//! field it carries already holds the same value in the store; only a stale
//! update that would change a field is a conflict.

use crate::error::{ConflictReport, HookError, HookResult, Result};
use crate::hooks::PreCommitHook;
use crate::models::{Commit, Record, MODEL_VERSION};
use crate::storage::Repository;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub struct CheckPreCommitHook {
    repository: Arc<dyn Repository>,
}

impl CheckPreCommitHook {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Checks `commit` against the current store state, stamping model
    /// versions on accepted inserts and updates.
    pub fn check(&self, commit: &mut Commit) -> Result<()> {
        let stage = commit.stage_id.clone();
        let stage = stage.as_deref();
        let mut report = ConflictReport::default();
        // An oid gets at most one version per commit.
        let mut claimed = HashSet::new();

        for insert in commit.inserts.iter_mut() {
            if !claimed.insert(insert.oid.clone()) || self.is_active(&insert.oid, stage)? {
                report.failed_inserts.push(insert.clone());
            } else {
                insert.set_model_version(1);
            }
        }

        for oid in &commit.deletions {
            if !claimed.insert(oid.clone()) || !self.is_active(oid, stage)? {
                report.failed_deletes.push(oid.clone());
            }
        }

        for update in commit.updates.iter_mut() {
            if !claimed.insert(update.oid.clone()) {
                debug!(oid = %update.oid, "object written twice in one commit");
                report.failed_updates.push(update.clone());
                continue;
            }
            match self.resolve_version(update, stage)? {
                Some(version) => update.set_model_version(version + 1),
                None => report.failed_updates.push(update.clone()),
            }
        }

        report.into_result()
    }

    fn current(&self, oid: &str, stage: Option<&str>) -> Result<Option<Record>> {
        self.repository.latest_record(oid, stage, i64::MAX)
    }

    fn is_active(&self, oid: &str, stage: Option<&str>) -> Result<bool> {
        Ok(self.current(oid, stage)?.is_some_and(|r| r.is_live()))
    }

    /// The version an update builds on, or `None` if it conflicts.
    fn resolve_version(&self, update: &Record, stage: Option<&str>) -> Result<Option<i64>> {
        let current = self.current(&update.oid, stage)?;
        let current_version = current
            .as_ref()
            .filter(|r| r.is_live())
            .map(Record::model_version)
            .transpose()?
            .flatten()
            .unwrap_or(0);

        let incoming = match update.model_version() {
            Ok(Some(version)) => version,
            Ok(None) => return Ok(Some(current_version)),
            Err(e) => {
                debug!(oid = %update.oid, error = %e, "unreadable model version");
                return Ok(None);
            }
        };

        if incoming == current_version {
            return Ok(Some(current_version));
        }

        match current.as_ref().and_then(|stored| first_difference(update, stored)) {
            None if current.is_some() => {
                debug!(
                    oid = %update.oid,
                    incoming,
                    current_version,
                    "stale model version without field changes, accepting"
                );
                Ok(Some(current_version))
            }
            None => {
                info!(oid = %update.oid, "conflict detected, object has no stored version");
                Ok(None)
            }
            Some(key) => {
                info!(
                    oid = %update.oid,
                    key,
                    incoming,
                    current_version,
                    "conflict detected, newer version of the object is stored"
                );
                Ok(None)
            }
        }
    }
}

/// First non-version key whose value in `incoming` is not the stored one.
fn first_difference<'a>(incoming: &'a Record, stored: &Record) -> Option<&'a str> {
    incoming
        .entries
        .iter()
        .filter(|(key, _)| key.as_str() != MODEL_VERSION)
        .find(|(key, value)| !stored.get(key).is_some_and(|rival| rival.same_as(value)))
        .map(|(key, _)| key.as_str())
}

impl PreCommitHook for CheckPreCommitHook {
    fn on_pre_commit(&self, commit: &mut Commit) -> HookResult<()> {
        self.check(commit).map_err(HookError::from)
    }
}
