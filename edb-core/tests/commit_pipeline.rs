use edb_core::{
    Commit, CommitFilter, EdbConfig, EdbService, Error, MemoryRepository, Record, Repository,
    SqliteRepository, StaticIdentity, MODEL_VERSION,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

fn repositories() -> Vec<(&'static str, Arc<dyn Repository>)> {
    vec![
        ("memory", Arc::new(MemoryRepository::new())),
        ("sqlite", Arc::new(SqliteRepository::in_memory().unwrap())),
    ]
}

fn service_over(repository: Arc<dyn Repository>) -> EdbService {
    EdbService::builder(repository)
        .identity(StaticIdentity::new("alice", "ctx"))
        .build()
        .unwrap()
}

fn each_service(test: impl Fn(&str, EdbService)) {
    for (name, repository) in repositories() {
        test(name, service_over(repository));
    }
}

fn apply(
    service: &EdbService,
    inserts: Vec<Record>,
    updates: Vec<Record>,
    deletions: Vec<&str>,
) -> edb_core::Result<i64> {
    let mut commit = service.create_commit(
        None,
        inserts,
        updates,
        deletions.into_iter().map(str::to_string).collect(),
    )?;
    service.commit(&mut commit)
}

fn named(oid: &str, name: &str) -> Record {
    Record::new(oid).with_entry("name", name)
}

#[test]
fn test_delete_and_resurrect_scenario() {
    each_service(|store, service| {
        let t1 = apply(&service, vec![named("a", "foo")], vec![], vec![]).unwrap();
        assert!(service.head_at(t1, None).unwrap().contains("a"), "{}", store);

        let t2 = apply(&service, vec![], vec![], vec!["a"]).unwrap();
        assert!(service.head_at(t2, None).unwrap().is_empty(), "{}", store);
        assert!(service.head_at(t1, None).unwrap().contains("a"), "{}", store);
        assert!(service.get_object("a").is_err(), "{}", store);

        let t3 = apply(&service, vec![named("a", "bar")], vec![], vec![]).unwrap();
        assert!(t1 < t2 && t2 < t3, "{}", store);
        assert_eq!(service.resurrected_oids(None).unwrap(), vec!["a"], "{}", store);
        assert_eq!(
            service.get_object("a").unwrap().get("name").unwrap().as_str(),
            Some("bar"),
            "{}",
            store
        );
        assert_eq!(service.get_history("a", None).unwrap().len(), 3, "{}", store);
    });
}

#[test]
fn test_version_fast_path() {
    each_service(|store, service| {
        apply(&service, vec![named("X", "foo")], vec![], vec![]).unwrap();
        let update = named("X", "bar").with_entry(MODEL_VERSION, 1i64);
        apply(&service, vec![], vec![update], vec![]).unwrap();

        let stored = service.get_object("X").unwrap();
        assert_eq!(stored.model_version().unwrap(), Some(2), "{}", store);
    });
}

#[test]
fn test_version_conflict() {
    each_service(|store, service| {
        apply(&service, vec![named("X", "foo")], vec![], vec![]).unwrap();
        let bump = named("X", "bar").with_entry(MODEL_VERSION, 1i64);
        apply(&service, vec![], vec![bump], vec![]).unwrap();

        let stale = named("X", "baz").with_entry(MODEL_VERSION, 1i64);
        let err = apply(&service, vec![], vec![stale], vec![]).unwrap_err();

        let report = err.conflict_report().unwrap();
        assert_eq!(report.failed_update_oids(), vec!["X"], "{}", store);
        assert_eq!(
            service.get_object("X").unwrap().get("name").unwrap().as_str(),
            Some("bar"),
            "{}",
            store
        );
    });
}

#[test]
fn test_oid_written_twice_in_one_commit_conflicts() {
    each_service(|store, service| {
        let err = apply(&service, vec![named("x", "foo"), named("x", "bar")], vec![], vec![])
            .unwrap_err();

        let report = err.conflict_report().unwrap();
        assert_eq!(report.failed_inserts.len(), 1, "{}", store);
        assert_eq!(report.failed_inserts[0].oid, "x", "{}", store);
        assert!(service.get_object("x").is_err(), "{}", store);
        assert!(service.get_history("x", None).unwrap().is_empty(), "{}", store);
    });
}

#[test]
fn test_compatible_stale_write() {
    each_service(|store, service| {
        apply(&service, vec![named("X", "foo")], vec![], vec![]).unwrap();
        let bump = named("X", "bar").with_entry(MODEL_VERSION, 1i64);
        apply(&service, vec![], vec![bump], vec![]).unwrap();

        let stale_but_equal = named("X", "bar").with_entry(MODEL_VERSION, 1i64);
        apply(&service, vec![], vec![stale_but_equal], vec![]).unwrap();

        let stored = service.get_object("X").unwrap();
        assert_eq!(stored.model_version().unwrap(), Some(3), "{}", store);
    });
}

#[test]
fn test_diff_is_symmetric() {
    each_service(|store, service| {
        let t1 = apply(&service, vec![named("a", "foo"), named("b", "keep")], vec![], vec![])
            .unwrap();
        apply(&service, vec![], vec![named("a", "bar")], vec!["b"]).unwrap();
        let t3 = apply(&service, vec![named("c", "new")], vec![], vec![]).unwrap();

        let forward = service.diff(t1, t3, None).unwrap();
        let backward = service.diff(t3, t1, None).unwrap();

        assert_eq!(forward.object_diffs, backward.object_diffs, "{}", store);
        assert_eq!(forward.start_timestamp(), t1, "{}", store);
        assert_eq!(forward.difference_count(), 3, "{}", store);

        let a = forward.get("a").unwrap();
        assert_eq!(a.difference_count(), 1, "{}", store);
        assert_eq!(a.entries["name"].before.as_ref().unwrap().as_str(), Some("foo"));
        assert_eq!(a.entries["name"].after.as_ref().unwrap().as_str(), Some("bar"));
        assert!(forward.get("b").unwrap().end.is_none(), "{}", store);
        assert!(forward.get("c").unwrap().start.is_none(), "{}", store);
    });
}

#[test]
fn test_head_is_idempotent() {
    each_service(|store, service| {
        let t1 = apply(&service, vec![named("a", "foo")], vec![], vec![]).unwrap();
        let first = service.head_at(t1, None).unwrap();
        let second = service.head_at(t1, None).unwrap();
        assert_eq!(first, second, "{}", store);
        assert_eq!(service.head(None).unwrap(), first, "{}", store);
    });
}

#[test]
fn test_stages_are_partitions() {
    each_service(|store, service| {
        let mut staged = service
            .create_commit(Some("s1"), vec![named("a", "staged")], vec![], vec![])
            .unwrap();
        service.commit(&mut staged).unwrap();

        assert!(service.get_object("a").is_err(), "{}", store);
        assert!(service.head(None).is_err(), "{}", store);
        assert_eq!(
            service.get_object_in_stage("a", Some("s1")).unwrap().stage_id.as_deref(),
            Some("s1"),
            "{}",
            store
        );

        apply(&service, vec![named("a", "default")], vec![], vec![]).unwrap();
        assert_eq!(service.head(Some("s1")).unwrap().len(), 1, "{}", store);
        assert_eq!(
            service
                .get_commits_matching(&CommitFilter::new().stage(Some("s1")))
                .unwrap()
                .len(),
            1,
            "{}",
            store
        );
    });
}

#[test]
fn test_concurrent_inserts_of_one_oid() {
    for (store, repository) in repositories() {
        let service = Arc::new(service_over(repository));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let service = Arc::clone(&service);
                thread::spawn(move || {
                    apply(&service, vec![named("shared", &i.to_string())], vec![], vec![]).is_ok()
                })
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 1, "{}", store);
        assert_eq!(service.get_history("shared", None).unwrap().len(), 1, "{}", store);
    }
}

/// Delegates to an in-memory store, failing writes while `fail` is set.
struct FlakyRepository {
    inner: MemoryRepository,
    fail: AtomicBool,
}

impl Repository for FlakyRepository {
    fn write_commit(&self, commit: &Commit, tombstones: &[Record]) -> edb_core::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        self.inner.write_commit(commit, tombstones)
    }

    fn latest_record(
        &self,
        oid: &str,
        stage: Option<&str>,
        at: i64,
    ) -> edb_core::Result<Option<Record>> {
        self.inner.latest_record(oid, stage, at)
    }

    fn history(
        &self,
        oid: &str,
        stage: Option<&str>,
        from: Option<i64>,
        to: Option<i64>,
    ) -> edb_core::Result<Vec<Record>> {
        self.inner.history(oid, stage, from, to)
    }

    fn head_records(&self, at: i64, stage: Option<&str>) -> edb_core::Result<Vec<Record>> {
        self.inner.head_records(at, stage)
    }

    fn resurrected_oids(&self, stage: Option<&str>) -> edb_core::Result<Vec<String>> {
        self.inner.resurrected_oids(stage)
    }

    fn commits(&self, filter: &CommitFilter) -> edb_core::Result<Vec<Commit>> {
        self.inner.commits(filter)
    }

    fn commit_by_revision(&self, revision: &Uuid) -> edb_core::Result<Option<Commit>> {
        self.inner.commit_by_revision(revision)
    }

    fn last_timestamp(&self) -> edb_core::Result<Option<i64>> {
        self.inner.last_timestamp()
    }
}

#[test]
fn test_persistence_failure_is_propagated_and_leaves_no_trace() {
    let repository = Arc::new(FlakyRepository {
        inner: MemoryRepository::new(),
        fail: AtomicBool::new(false),
    });
    let service = service_over(repository.clone());
    apply(&service, vec![named("a", "foo")], vec![], vec![]).unwrap();
    let before = service.head(None).unwrap();

    repository.fail.store(true, Ordering::SeqCst);
    let mut commit = service
        .create_commit(None, vec![named("b", "bar")], vec![], vec!["a".to_string()])
        .unwrap();
    let err = service.commit(&mut commit).unwrap_err();

    assert!(matches!(err, Error::Persistence(_)));
    assert!(!commit.committed);
    assert!(commit.timestamp.is_none());
    assert_eq!(service.head(None).unwrap(), before);

    repository.fail.store(false, Ordering::SeqCst);
    assert!(service.commit(&mut commit).is_ok());
}

#[test]
fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = EdbConfig::default().with_database_path(dir.path().join("edb.db"));
    let identity = StaticIdentity::new("alice", "ctx");

    let t1 = {
        let service = EdbService::open(&config, identity.clone()).unwrap();
        apply(&service, vec![named("a", "foo")], vec![], vec![]).unwrap()
    };

    let service = EdbService::open(&config, identity).unwrap();
    let t2 = apply(&service, vec![named("b", "bar")], vec![], vec![]).unwrap();

    assert!(t2 > t1);
    assert_eq!(service.head(None).unwrap().len(), 2);
    assert_eq!(service.get_object("a").unwrap().timestamp, t1);
}
