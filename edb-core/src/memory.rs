//! In-memory [`Repository`], indexed by `(stage, oid, timestamp)`.

use crate::error::{Error, Result};
use crate::models::{Commit, Record};
use crate::query::CommitFilter;
use crate::storage::Repository;
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

type PartitionKey = (Option<String>, String);

#[derive(Default)]
struct State {
    versions: BTreeMap<PartitionKey, BTreeMap<i64, Record>>,
    /// Ordered by timestamp; commits are appended in timestamp order.
    commits: Vec<Commit>,
}

impl State {
    fn versions_of(&self, oid: &str, stage: Option<&str>) -> Option<&BTreeMap<i64, Record>> {
        self.versions
            .get(&(stage.map(str::to_string), oid.to_string()))
    }

    fn partition<'a>(
        &'a self,
        stage: Option<&'a str>,
    ) -> impl Iterator<Item = (&'a String, &'a BTreeMap<i64, Record>)> + 'a {
        self.versions
            .iter()
            .filter(move |((s, _), _)| s.as_deref() == stage)
            .map(|((_, oid), versions)| (oid, versions))
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn write_commit(&self, commit: &Commit, tombstones: &[Record]) -> Result<()> {
        let timestamp = commit
            .timestamp
            .ok_or_else(|| Error::InvalidValue("commit has no timestamp".to_string()))?;
        let mut state = self.state.write()?;

        if state.commits.iter().any(|c| c.revision == commit.revision) {
            return Err(Error::InvalidValue(format!(
                "revision {} is already stored",
                commit.revision
            )));
        }
        if state
            .commits
            .last()
            .and_then(|c| c.timestamp)
            .is_some_and(|last| last >= timestamp)
        {
            return Err(Error::InvalidValue(format!(
                "commit timestamp {} does not advance the store",
                timestamp
            )));
        }

        // Validate the whole write set before touching the state.
        let records: Vec<&Record> = commit.objects().chain(tombstones.iter()).collect();
        let mut seen = HashSet::new();
        for record in &records {
            let key = (record.stage_id.clone(), record.oid.clone());
            let taken = state
                .versions
                .get(&key)
                .is_some_and(|v| v.contains_key(&record.timestamp));
            if taken || !seen.insert((key, record.timestamp)) {
                return Err(Error::DuplicateVersion {
                    oid: record.oid.clone(),
                    timestamp: record.timestamp,
                });
            }
        }

        for record in records {
            state
                .versions
                .entry((record.stage_id.clone(), record.oid.clone()))
                .or_default()
                .insert(record.timestamp, record.clone());
        }
        state.commits.push(commit.clone());
        Ok(())
    }

    fn latest_record(&self, oid: &str, stage: Option<&str>, at: i64) -> Result<Option<Record>> {
        debug!(oid, stage, at, "loading newest record");
        let state = self.state.read()?;
        Ok(state
            .versions_of(oid, stage)
            .and_then(|versions| versions.range(..=at).next_back())
            .map(|(_, record)| record.clone()))
    }

    fn history(
        &self,
        oid: &str,
        stage: Option<&str>,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<Record>> {
        debug!(oid, stage, ?from, ?to, "loading history");
        let (from, to) = (from.unwrap_or(i64::MIN), to.unwrap_or(i64::MAX));
        if from > to {
            return Ok(Vec::new());
        }
        let state = self.state.read()?;
        Ok(state
            .versions_of(oid, stage)
            .map(|versions| versions.range(from..=to).map(|(_, r)| r.clone()).collect())
            .unwrap_or_default())
    }

    fn head_records(&self, at: i64, stage: Option<&str>) -> Result<Vec<Record>> {
        debug!(at, stage, "loading head");
        let state = self.state.read()?;
        Ok(state
            .partition(stage)
            .filter_map(|(_, versions)| versions.range(..=at).next_back())
            .map(|(_, record)| record)
            .filter(|record| record.is_live())
            .cloned()
            .collect())
    }

    fn resurrected_oids(&self, stage: Option<&str>) -> Result<Vec<String>> {
        debug!(stage, "loading resurrected oids");
        let state = self.state.read()?;
        Ok(state
            .partition(stage)
            .filter(|(_, versions)| {
                let first_tombstone = versions.values().find(|r| r.deleted);
                first_tombstone.is_some_and(|tombstone| {
                    versions
                        .range(tombstone.timestamp + 1..)
                        .any(|(_, r)| r.is_live())
                })
            })
            .map(|(oid, _)| oid.clone())
            .collect())
    }

    fn commits(&self, filter: &CommitFilter) -> Result<Vec<Commit>> {
        debug!(?filter, "loading commits");
        let state = self.state.read()?;
        Ok(state
            .commits
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    fn latest_commit(&self, filter: &CommitFilter) -> Result<Option<Commit>> {
        let state = self.state.read()?;
        Ok(state
            .commits
            .iter()
            .rev()
            .find(|c| filter.matches(c))
            .cloned())
    }

    fn commit_by_revision(&self, revision: &Uuid) -> Result<Option<Commit>> {
        let state = self.state.read()?;
        Ok(state
            .commits
            .iter()
            .find(|c| c.revision == *revision)
            .cloned())
    }

    fn last_timestamp(&self) -> Result<Option<i64>> {
        let state = self.state.read()?;
        Ok(state.commits.last().and_then(|c| c.timestamp))
    }
}
