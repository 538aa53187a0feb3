//! The commit pipeline and the read side of the store.
//!
//! [`EdbService::commit`] runs a commit through the begin-commit hooks, the
//! pre-commit hooks and the persist step, or through the error hooks when a
//! pre-commit hook rejects it. Pre-commit hooks and the persist step share
//! one write section per service, so timestamps strictly increase and a
//! conflict check never interleaves with another commit's write.
//!
//! Reads go straight to the [`Repository`], which only ever exposes whole
//! commits.

use crate::checker::CheckPreCommitHook;
use crate::config::EdbConfig;
use crate::diff::Diff;
use crate::error::{Error, HookError, Result};
use crate::hooks::{
    AuthContext, BeginCommitHook, ContextHolder, ErrorHook, Hooks, PostCommitHook, PreCommitHook,
    StaticIdentity,
};
use crate::models::{Commit, CommitMetaInfo, Head, LogEntry, Record};
use crate::query::{CommitFilter, CommitQuery, QueryRequest};
use crate::storage::{Repository, SqliteRepository};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type HeadKey = (Option<String>, i64);

pub struct EdbService {
    repository: Arc<dyn Repository>,
    hooks: Hooks,
    auth: Box<dyn AuthContext>,
    context: Box<dyn ContextHolder>,
    revision_check_enabled: bool,
    /// The write section. Holds the last timestamp handed out.
    write_lock: Mutex<Option<i64>>,
    /// Heads at or before this time can no longer change.
    settled_through: AtomicI64,
    heads: Mutex<HashMap<HeadKey, Head>>,
    head_cache_capacity: usize,
}

pub struct EdbServiceBuilder {
    repository: Arc<dyn Repository>,
    hooks: Hooks,
    auth: Box<dyn AuthContext>,
    context: Box<dyn ContextHolder>,
    revision_check_enabled: bool,
    conflict_checks: bool,
    head_cache_capacity: usize,
}

impl EdbServiceBuilder {
    fn new(repository: Arc<dyn Repository>) -> Self {
        let config = EdbConfig::default();
        let identity = StaticIdentity::new("anonymous", "default");
        Self {
            repository,
            hooks: Hooks::default(),
            auth: Box::new(identity.clone()),
            context: Box::new(identity),
            revision_check_enabled: config.revision_check_enabled,
            conflict_checks: config.conflict_checks,
            head_cache_capacity: config.head_cache_capacity,
        }
    }

    pub fn configure(mut self, config: &EdbConfig) -> Self {
        self.revision_check_enabled = config.revision_check_enabled;
        self.conflict_checks = config.conflict_checks;
        self.head_cache_capacity = config.head_cache_capacity;
        self
    }

    pub fn begin_commit_hook(mut self, hook: impl BeginCommitHook + 'static) -> Self {
        self.hooks.begin_commit.push(Box::new(hook));
        self
    }

    pub fn pre_commit_hook(mut self, hook: impl PreCommitHook + 'static) -> Self {
        self.hooks.pre_commit.push(Box::new(hook));
        self
    }

    pub fn post_commit_hook(mut self, hook: impl PostCommitHook + 'static) -> Self {
        self.hooks.post_commit.push(Box::new(hook));
        self
    }

    pub fn error_hook(mut self, hook: impl ErrorHook + 'static) -> Self {
        self.hooks.error.push(Box::new(hook));
        self
    }

    pub fn identity(mut self, identity: StaticIdentity) -> Self {
        self.auth = Box::new(identity.clone());
        self.context = Box::new(identity);
        self
    }

    pub fn auth_context(mut self, auth: impl AuthContext + 'static) -> Self {
        self.auth = Box::new(auth);
        self
    }

    pub fn context_holder(mut self, context: impl ContextHolder + 'static) -> Self {
        self.context = Box::new(context);
        self
    }

    pub fn revision_check(mut self, enabled: bool) -> Self {
        self.revision_check_enabled = enabled;
        self
    }

    pub fn conflict_checks(mut self, enabled: bool) -> Self {
        self.conflict_checks = enabled;
        self
    }

    pub fn head_cache_capacity(mut self, capacity: usize) -> Self {
        self.head_cache_capacity = capacity;
        self
    }

    pub fn build(mut self) -> Result<EdbService> {
        if self.conflict_checks {
            let checker = CheckPreCommitHook::new(Arc::clone(&self.repository));
            self.hooks.pre_commit.insert(0, Box::new(checker));
        }
        let last = self.repository.last_timestamp()?;

        Ok(EdbService {
            repository: self.repository,
            hooks: self.hooks,
            auth: self.auth,
            context: self.context,
            revision_check_enabled: self.revision_check_enabled,
            write_lock: Mutex::new(last),
            settled_through: AtomicI64::new(last.unwrap_or(i64::MIN)),
            heads: Mutex::new(HashMap::new()),
            head_cache_capacity: self.head_cache_capacity,
        })
    }
}

impl EdbService {
    pub fn builder(repository: Arc<dyn Repository>) -> EdbServiceBuilder {
        EdbServiceBuilder::new(repository)
    }

    /// A SQLite-backed service; in-memory when the config names no file.
    pub fn open(config: &EdbConfig, identity: StaticIdentity) -> Result<Self> {
        let repository: Arc<dyn Repository> = match &config.database.path {
            Some(path) => Arc::new(SqliteRepository::new(path)?),
            None => Arc::new(SqliteRepository::in_memory()?),
        };
        Self::builder(repository)
            .configure(config)
            .identity(identity)
            .build()
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// A new commit stamped with the current principal and context, built on
    /// the current revision of `stage`.
    pub fn create_commit(
        &self,
        stage: Option<&str>,
        inserts: Vec<Record>,
        updates: Vec<Record>,
        deletions: Vec<String>,
    ) -> Result<Commit> {
        let mut commit = Commit::new(
            self.auth.authenticated_principal(),
            self.context.current_context_id(),
        );
        commit.parent_revision = self.current_revision(stage)?;
        commit.stage_id = stage.map(str::to_string);
        commit
            .insert_all(inserts)
            .update_all(updates)
            .delete_all(deletions);
        Ok(commit)
    }

    /// Applies `commit` and returns its timestamp.
    ///
    /// On success `commit` is marked committed and carries its timestamp and
    /// stamped records. If an error hook supplies a replacement, `commit` is
    /// replaced by it before the replacement is applied.
    pub fn commit(&self, commit: &mut Commit) -> Result<i64> {
        if commit.committed {
            return Err(Error::AlreadyCommitted(commit.revision));
        }
        debug!(revision = %commit.revision, "applying commit");

        self.check_revision(commit)?;
        self.run_begin_commit_hooks(commit)?;

        let rejection = {
            // Still usable after a hook panicked; `persist` re-reads the last timestamp.
            let mut last = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            match self.run_pre_commit_hooks(commit) {
                Some(rejection) => rejection,
                None => {
                    self.check_revision(commit)?;
                    let timestamp = self.persist(commit, &mut last)?;
                    drop(last);
                    self.run_post_commit_hooks(commit);
                    return Ok(timestamp);
                }
            }
        };

        self.run_error_hooks(commit, rejection)
    }

    fn check_revision(&self, commit: &Commit) -> Result<()> {
        if !self.revision_check_enabled {
            return Ok(());
        }
        let Some(expected) = commit.parent_revision else {
            return Ok(());
        };
        let actual = self.current_revision(commit.stage_id.as_deref())?;
        if actual == Some(expected) {
            Ok(())
        } else {
            info!(revision = %commit.revision, %expected, ?actual, "stale head");
            Err(Error::StaleHead {
                expected: Some(expected),
                actual,
            })
        }
    }

    fn run_begin_commit_hooks(&self, commit: &mut Commit) -> Result<()> {
        for hook in &self.hooks.begin_commit {
            match hook.on_start_commit(commit) {
                Ok(()) => {}
                Err(HookError::Unavailable) => debug!("begin-commit hook unavailable"),
                Err(HookError::Edb(e)) => return Err(e),
                Err(HookError::Fault(e)) => warn!(error = %e, "begin-commit hook failed"),
            }
        }
        Ok(())
    }

    /// Returns the error of the first hook that rejects the commit.
    fn run_pre_commit_hooks(&self, commit: &mut Commit) -> Option<Error> {
        for hook in &self.hooks.pre_commit {
            match hook.on_pre_commit(commit) {
                Ok(()) => {}
                Err(HookError::Unavailable) => debug!("pre-commit hook unavailable"),
                Err(HookError::Edb(e)) => {
                    info!(revision = %commit.revision, error = %e, "commit rejected");
                    return Some(e);
                }
                Err(HookError::Fault(e)) => warn!(error = %e, "pre-commit hook failed"),
            }
        }
        None
    }

    fn run_error_hooks(&self, commit: &mut Commit, rejection: Error) -> Result<i64> {
        for hook in &self.hooks.error {
            match hook.on_error(commit, &rejection) {
                Ok(Some(replacement)) => {
                    info!(
                        revision = %commit.revision,
                        replacement = %replacement.revision,
                        "error hook supplied a replacement commit"
                    );
                    *commit = replacement;
                    return self.commit(commit);
                }
                Ok(None) => {}
                Err(HookError::Unavailable) => debug!("error hook unavailable"),
                Err(HookError::Edb(e)) => return Err(e),
                Err(HookError::Fault(e)) => warn!(error = %e, "error hook failed"),
            }
        }
        Err(rejection)
    }

    fn run_post_commit_hooks(&self, commit: &Commit) {
        for hook in &self.hooks.post_commit {
            match hook.on_post_commit(commit) {
                Ok(()) => {}
                Err(HookError::Unavailable) => debug!("post-commit hook unavailable"),
                Err(e) => warn!(revision = %commit.revision, error = %e, "post-commit hook failed"),
            }
        }
    }

    /// Stamps and writes `commit`. Must be called inside the write section.
    fn persist(&self, commit: &mut Commit, last: &mut Option<i64>) -> Result<i64> {
        let stored_last = self
            .repository
            .last_timestamp()
            .map_err(|e| Error::Persistence(Box::new(e)))?;
        let floor = (*last).max(stored_last);
        let timestamp = floor.map_or(now_millis(), |l| now_millis().max(l + 1));

        let mut staged = commit.clone();
        let stage = staged.stage_id.clone();
        for record in staged.inserts.iter_mut().chain(staged.updates.iter_mut()) {
            record.timestamp = timestamp;
            record.stage_id = stage.clone();
            record.deleted = false;
        }
        staged.timestamp = Some(timestamp);
        staged.committed = true;

        let tombstones: Vec<Record> = staged
            .deletions
            .iter()
            .map(|oid| Record::tombstone(oid.clone(), timestamp, stage.clone()))
            .collect();

        if let Err(e) = self.repository.write_commit(&staged, &tombstones) {
            error!(revision = %staged.revision, error = %e, "commit rolled back");
            return Err(Error::Persistence(Box::new(e)));
        }

        *last = Some(timestamp);
        self.settled_through.fetch_max(timestamp, Ordering::SeqCst);
        *commit = staged;
        info!(
            revision = %commit.revision,
            timestamp,
            inserts = commit.inserts.len(),
            updates = commit.updates.len(),
            deletions = commit.deletions.len(),
            "commit persisted"
        );
        Ok(timestamp)
    }

    pub fn get_object(&self, oid: &str) -> Result<Record> {
        self.load_object(oid, None, i64::MAX)
    }

    pub fn get_object_at(&self, oid: &str, timestamp: i64) -> Result<Record> {
        self.load_object(oid, None, timestamp)
    }

    pub fn get_object_in_stage(&self, oid: &str, stage: Option<&str>) -> Result<Record> {
        self.load_object(oid, stage, i64::MAX)
    }

    pub fn get_object_in_stage_at(
        &self,
        oid: &str,
        stage: Option<&str>,
        timestamp: i64,
    ) -> Result<Record> {
        self.load_object(oid, stage, timestamp)
    }

    fn load_object(&self, oid: &str, stage: Option<&str>, timestamp: i64) -> Result<Record> {
        debug!(oid, stage, timestamp, "loading object");
        self.repository
            .latest_record(oid, stage, timestamp)?
            .filter(Record::is_live)
            .ok_or_else(|| Error::ObjectNotFound(oid.to_string()))
    }

    /// The current version of every listed oid that is live; others are skipped.
    pub fn get_objects(&self, oids: &[String], stage: Option<&str>) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(oids.len());
        for oid in oids {
            match self.load_object(oid, stage, i64::MAX) {
                Ok(record) => records.push(record),
                Err(Error::ObjectNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    pub fn get_history(&self, oid: &str, stage: Option<&str>) -> Result<Vec<Record>> {
        self.repository.history(oid, stage, None, None)
    }

    pub fn get_history_between(
        &self,
        oid: &str,
        from: i64,
        to: i64,
        stage: Option<&str>,
    ) -> Result<Vec<Record>> {
        self.repository.history(oid, stage, Some(from), Some(to))
    }

    /// History of `oid` in `[from, to]`, each version paired with its commit.
    pub fn get_log(
        &self,
        oid: &str,
        from: i64,
        to: i64,
        stage: Option<&str>,
    ) -> Result<Vec<LogEntry>> {
        debug!(oid, from, to, stage, "loading log");
        let history = self.repository.history(oid, stage, Some(from), Some(to))?;
        let commits: Vec<Commit> = self
            .repository
            .commits(&CommitFilter::new().stage(stage).up_to(to))?
            .into_iter()
            .filter(|c| c.timestamp.is_some_and(|ts| ts >= from) && c.touches(oid))
            .collect();

        if commits.len() != history.len() {
            return Err(Error::InconsistentLog {
                commits: commits.len(),
                history: history.len(),
            });
        }

        Ok(commits
            .into_iter()
            .zip(history)
            .map(|(commit, record)| LogEntry { commit, record })
            .collect())
    }

    /// The head after the newest commit of `stage`.
    pub fn head(&self, stage: Option<&str>) -> Result<Head> {
        let latest = self
            .repository
            .latest_commit(&CommitFilter::new().stage(stage))?
            .and_then(|c| c.timestamp)
            .ok_or(Error::HeadNotFound(now_millis()))?;
        self.head_at(latest, stage)
    }

    /// The live objects of `stage` as of `timestamp`.
    pub fn head_at(&self, timestamp: i64, stage: Option<&str>) -> Result<Head> {
        let key = (stage.map(str::to_string), timestamp);
        if let Some(head) = self.heads.lock()?.get(&key) {
            debug!(timestamp, stage, "head served from cache");
            return Ok(head.clone());
        }

        debug!(timestamp, stage, "loading head");
        // Read before loading: a commit stamped `timestamp` may land meanwhile.
        let settled = self.settled_through.load(Ordering::SeqCst);
        let exists = self
            .repository
            .latest_commit(&CommitFilter::new().stage(stage).up_to(timestamp))?
            .is_some();
        if !exists {
            return Err(Error::HeadNotFound(timestamp));
        }

        let records = self.repository.head_records(timestamp, stage)?;
        let head = Head::new(timestamp, stage.map(str::to_string), records);

        if self.head_cache_capacity > 0 && timestamp <= settled {
            let mut heads = self.heads.lock()?;
            while heads.len() >= self.head_cache_capacity {
                let Some(oldest) = heads.keys().min_by_key(|(_, ts)| *ts).cloned() else {
                    break;
                };
                heads.remove(&oldest);
            }
            heads.insert(key, head.clone());
        }
        Ok(head)
    }

    /// Live objects matching every parameter of `request`. Empty when no head
    /// exists yet.
    pub fn query(&self, request: &QueryRequest) -> Result<Vec<Record>> {
        debug!(?request, "running query");
        let stage = request.stage_id.as_deref();
        let head = match request.timestamp {
            Some(timestamp) => self.head_at(timestamp, stage),
            None => self.head(stage),
        };
        let head = match head {
            Ok(head) => head,
            Err(Error::HeadNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(head
            .objects
            .into_values()
            .filter(|record| request.matches(record))
            .collect())
    }

    pub fn get_commits_matching(&self, filter: &CommitFilter) -> Result<Vec<Commit>> {
        debug!(?filter, "loading matching commits");
        self.repository.commits(filter)
    }

    pub fn get_last_commit_matching(&self, filter: &CommitFilter) -> Result<Commit> {
        self.repository
            .latest_commit(filter)?
            .ok_or_else(|| Error::CommitNotFound(format!("no commit matches {:?}", filter)))
    }

    /// The newest commit of `stage` at or before `timestamp`.
    pub fn get_commit_at(&self, timestamp: i64, stage: Option<&str>) -> Result<Commit> {
        self.repository
            .latest_commit(&CommitFilter::new().stage(stage).up_to(timestamp))?
            .ok_or_else(|| Error::CommitNotFound(format!("no commit at or before {}", timestamp)))
    }

    pub fn get_commit_by_revision(&self, revision: &Uuid) -> Result<Commit> {
        self.repository
            .commit_by_revision(revision)?
            .ok_or_else(|| Error::CommitNotFound(revision.to_string()))
    }

    /// Revision of the newest commit of `stage`.
    pub fn current_revision(&self, stage: Option<&str>) -> Result<Option<Uuid>> {
        Ok(self
            .repository
            .latest_commit(&CommitFilter::new().stage(stage))?
            .map(|c| c.revision))
    }

    pub fn last_revision_of_context(
        &self,
        context_id: &str,
        stage: Option<&str>,
    ) -> Result<Option<Uuid>> {
        Ok(self
            .repository
            .latest_commit(&CommitFilter::new().context(context_id).stage(stage))?
            .map(|c| c.revision))
    }

    pub fn revisions_of_matching_commits(&self, query: &CommitQuery) -> Result<Vec<CommitMetaInfo>> {
        let filter = query.filter().up_to(query.end_timestamp);
        Ok(self
            .repository
            .commits(&filter)?
            .iter()
            .filter(|c| query.matches(c))
            .map(Commit::meta_info)
            .collect())
    }

    /// The head as of the newest commit matching `filter`.
    pub fn state_of_last_commit_matching(&self, filter: &CommitFilter) -> Result<Head> {
        let commit = self.get_last_commit_matching(filter)?;
        let timestamp = commit
            .timestamp
            .ok_or_else(|| Error::CommitNotFound(commit.revision.to_string()))?;
        self.head_at(timestamp, commit.stage_id.as_deref())
    }

    pub fn resurrected_oids(&self, stage: Option<&str>) -> Result<Vec<String>> {
        self.repository.resurrected_oids(stage)
    }

    /// Differences between the heads of `stage` at two times, in either order.
    pub fn diff(&self, first: i64, second: i64, stage: Option<&str>) -> Result<Diff> {
        self.diff_stages(first, stage, second, stage)
    }

    pub fn diff_stages(
        &self,
        first: i64,
        first_stage: Option<&str>,
        second: i64,
        second_stage: Option<&str>,
    ) -> Result<Diff> {
        debug!(first, second, "computing diff");
        let start = (
            self.get_commit_at(first, first_stage)?,
            self.head_at(first, first_stage)?,
        );
        let end = (
            self.get_commit_at(second, second_stage)?,
            self.head_at(second, second_stage)?,
        );
        Ok(Diff::new(start, end))
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
