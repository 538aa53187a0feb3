use crate::error::{Error, Result};
use crate::models::{Commit, Record, Value};
use crate::query::CommitFilter;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

const SCHEMA_VERSION: i32 = 1;

/// Stage ids are stored as text; the default partition is the empty string.
const DEFAULT_STAGE: &str = "";

/// Durable home of records and commits.
///
/// Every read is confined to one stage partition (`None` is the default
/// partition). `write_commit` must be atomic: either the commit, all of its
/// records and all tombstones become visible, or nothing does.
pub trait Repository: Send + Sync {
    fn write_commit(&self, commit: &Commit, tombstones: &[Record]) -> Result<()>;

    /// The newest version of `oid` at or before `at`, tombstones included.
    fn latest_record(&self, oid: &str, stage: Option<&str>, at: i64) -> Result<Option<Record>>;

    /// All versions of `oid` within `[from, to]`, oldest first.
    fn history(
        &self,
        oid: &str,
        stage: Option<&str>,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<Record>>;

    /// The newest live version of every oid as of `at`, ordered by oid.
    fn head_records(&self, at: i64, stage: Option<&str>) -> Result<Vec<Record>>;

    /// Oids with a live version newer than one of their tombstones.
    fn resurrected_oids(&self, stage: Option<&str>) -> Result<Vec<String>>;

    /// Matching commits, oldest first.
    fn commits(&self, filter: &CommitFilter) -> Result<Vec<Commit>>;

    /// The matching commit with the greatest timestamp.
    fn latest_commit(&self, filter: &CommitFilter) -> Result<Option<Commit>> {
        Ok(self.commits(filter)?.pop())
    }

    fn commit_by_revision(&self, revision: &Uuid) -> Result<Option<Commit>>;

    /// Greatest commit timestamp across all stages.
    fn last_timestamp(&self) -> Result<Option<i64>>;
}

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock()?)
    }
}

fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            oid TEXT NOT NULL,
            stage_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            deleted INTEGER NOT NULL,
            UNIQUE (stage_id, oid, timestamp)
        );

        CREATE TABLE IF NOT EXISTS entries (
            record_id INTEGER NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            type TEXT NOT NULL,
            PRIMARY KEY (record_id, key),
            FOREIGN KEY (record_id) REFERENCES records(id)
        );

        CREATE TABLE IF NOT EXISTS commits (
            revision TEXT PRIMARY KEY,
            parent TEXT,
            committer TEXT NOT NULL,
            context TEXT NOT NULL,
            domain_id TEXT,
            connector_id TEXT,
            instance_id TEXT,
            comment TEXT,
            stage_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            committed INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS commit_records (
            revision TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (revision, record_id),
            FOREIGN KEY (revision) REFERENCES commits(revision),
            FOREIGN KEY (record_id) REFERENCES records(id)
        );

        CREATE TABLE IF NOT EXISTS commit_deletions (
            revision TEXT NOT NULL,
            oid TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (revision, position),
            FOREIGN KEY (revision) REFERENCES commits(revision)
        );

        CREATE INDEX IF NOT EXISTS idx_records_deleted ON records(stage_id, deleted);
        CREATE INDEX IF NOT EXISTS idx_commits_timestamp ON commits(stage_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_commits_context ON commits(context);
        "#,
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()?;

    if version.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
    }

    Ok(())
}

impl Repository for SqliteRepository {
    fn write_commit(&self, commit: &Commit, tombstones: &[Record]) -> Result<()> {
        let timestamp = commit
            .timestamp
            .ok_or_else(|| Error::InvalidValue("commit has no timestamp".to_string()))?;
        let revision = commit.revision.to_string();
        let mut conn = self.conn()?;
        // Dropping the transaction without commit rolls everything back.
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO commits (revision, parent, committer, context, domain_id, connector_id,
                                  instance_id, comment, stage_id, timestamp, committed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                revision,
                commit.parent_revision.map(|p| p.to_string()),
                commit.committer,
                commit.context_id,
                commit.domain_id,
                commit.connector_id,
                commit.instance_id,
                commit.comment,
                stage_key(commit.stage_id.as_deref()),
                timestamp,
                commit.committed,
            ],
        )?;

        let written = [("insert", &commit.inserts[..]), ("update", &commit.updates[..])];
        for (kind, records) in written {
            for (position, record) in records.iter().enumerate() {
                let record_id = insert_record(&tx, record)?;
                tx.execute(
                    "INSERT INTO commit_records (revision, record_id, kind, position)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![revision, record_id, kind, position as i64],
                )?;
            }
        }

        for (position, oid) in commit.deletions.iter().enumerate() {
            tx.execute(
                "INSERT INTO commit_deletions (revision, oid, position) VALUES (?1, ?2, ?3)",
                params![revision, oid, position as i64],
            )?;
        }

        for tombstone in tombstones {
            insert_record(&tx, tombstone)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn latest_record(&self, oid: &str, stage: Option<&str>, at: i64) -> Result<Option<Record>> {
        debug!(oid, stage, at, "loading newest record");
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, oid, stage_id, timestamp, deleted FROM records
                 WHERE oid = ?1 AND stage_id = ?2 AND timestamp <= ?3
                 ORDER BY timestamp DESC LIMIT 1",
                params![oid, stage_key(stage), at],
                record_from_row,
            )
            .optional()?;

        row.map(|(id, record)| with_entries(&conn, id, record))
            .transpose()
    }

    fn history(
        &self,
        oid: &str,
        stage: Option<&str>,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<Record>> {
        debug!(oid, stage, ?from, ?to, "loading history");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, oid, stage_id, timestamp, deleted FROM records
             WHERE oid = ?1 AND stage_id = ?2 AND timestamp BETWEEN ?3 AND ?4
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map(
                params![
                    oid,
                    stage_key(stage),
                    from.unwrap_or(i64::MIN),
                    to.unwrap_or(i64::MAX)
                ],
                record_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, record)| with_entries(&conn, id, record))
            .collect()
    }

    fn head_records(&self, at: i64, stage: Option<&str>) -> Result<Vec<Record>> {
        debug!(at, stage, "loading head");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT r.id, r.oid, r.stage_id, r.timestamp, r.deleted FROM records r
             WHERE r.stage_id = ?1 AND r.deleted = 0 AND r.timestamp = (
                 SELECT MAX(m.timestamp) FROM records m
                 WHERE m.stage_id = r.stage_id AND m.oid = r.oid AND m.timestamp <= ?2
             )
             ORDER BY r.oid ASC",
        )?;
        let rows = stmt
            .query_map(params![stage_key(stage), at], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, record)| with_entries(&conn, id, record))
            .collect()
    }

    fn resurrected_oids(&self, stage: Option<&str>) -> Result<Vec<String>> {
        debug!(stage, "loading resurrected oids");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT r.oid FROM records r
             WHERE r.stage_id = ?1 AND r.deleted = 0 AND EXISTS (
                 SELECT 1 FROM records d
                 WHERE d.stage_id = r.stage_id AND d.oid = r.oid
                   AND d.deleted = 1 AND d.timestamp < r.timestamp
             )
             ORDER BY r.oid ASC",
        )?;
        let oids = stmt
            .query_map(params![stage_key(stage)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(oids)
    }

    fn commits(&self, filter: &CommitFilter) -> Result<Vec<Commit>> {
        debug!(?filter, "loading commits");
        let conn = self.conn()?;
        select_commits(&conn, filter, "ORDER BY timestamp ASC")
    }

    fn latest_commit(&self, filter: &CommitFilter) -> Result<Option<Commit>> {
        debug!(?filter, "loading latest commit");
        let conn = self.conn()?;
        Ok(select_commits(&conn, filter, "ORDER BY timestamp DESC LIMIT 1")?.pop())
    }

    fn commit_by_revision(&self, revision: &Uuid) -> Result<Option<Commit>> {
        debug!(%revision, "loading commit by revision");
        let conn = self.conn()?;
        let commit = conn
            .query_row(
                &format!("SELECT {} FROM commits WHERE revision = ?1", COMMIT_COLUMNS),
                params![revision.to_string()],
                commit_from_row,
            )
            .optional()?;

        commit.map(|c| with_write_set(&conn, c)).transpose()
    }

    fn last_timestamp(&self) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let timestamp = conn.query_row("SELECT MAX(timestamp) FROM commits", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?;
        Ok(timestamp)
    }
}

const COMMIT_COLUMNS: &str = "revision, parent, committer, context, domain_id, connector_id, \
                              instance_id, comment, stage_id, timestamp, committed";

fn stage_key(stage: Option<&str>) -> &str {
    stage.unwrap_or(DEFAULT_STAGE)
}

fn stage_from_key(key: String) -> Option<String> {
    if key == DEFAULT_STAGE {
        None
    } else {
        Some(key)
    }
}

fn insert_record(conn: &Connection, record: &Record) -> Result<i64> {
    conn.execute(
        "INSERT INTO records (oid, stage_id, timestamp, deleted) VALUES (?1, ?2, ?3, ?4)",
        params![
            record.oid,
            stage_key(record.stage_id.as_deref()),
            record.timestamp,
            record.deleted,
        ],
    )?;
    let record_id = conn.last_insert_rowid();

    for (key, value) in &record.entries {
        conn.execute(
            "INSERT INTO entries (record_id, key, value, type) VALUES (?1, ?2, ?3, ?4)",
            params![record_id, key, value.encode(), value.type_tag()],
        )?;
    }

    Ok(record_id)
}

fn record_from_row(row: &Row) -> rusqlite::Result<(i64, Record)> {
    let id: i64 = row.get(0)?;
    let oid: String = row.get(1)?;
    let stage_id: String = row.get(2)?;
    let timestamp: i64 = row.get(3)?;
    let deleted: bool = row.get(4)?;

    Ok((
        id,
        Record {
            oid,
            entries: Default::default(),
            deleted,
            timestamp,
            stage_id: stage_from_key(stage_id),
        },
    ))
}

fn with_entries(conn: &Connection, record_id: i64, mut record: Record) -> Result<Record> {
    let mut stmt =
        conn.prepare_cached("SELECT key, value, type FROM entries WHERE record_id = ?1")?;
    let rows = stmt
        .query_map(params![record_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (key, value, type_tag) in rows {
        record.entries.insert(key, Value::decode(&type_tag, &value)?);
    }
    Ok(record)
}

fn parse_uuid(index: usize, text: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn commit_from_row(row: &Row) -> rusqlite::Result<Commit> {
    let revision: String = row.get(0)?;
    let parent: Option<String> = row.get(1)?;
    let stage_id: String = row.get(8)?;

    Ok(Commit {
        revision: parse_uuid(0, &revision)?,
        parent_revision: parent.map(|p| parse_uuid(1, &p)).transpose()?,
        committer: row.get(2)?,
        context_id: row.get(3)?,
        domain_id: row.get(4)?,
        connector_id: row.get(5)?,
        instance_id: row.get(6)?,
        comment: row.get(7)?,
        stage_id: stage_from_key(stage_id),
        inserts: Vec::new(),
        updates: Vec::new(),
        deletions: Vec::new(),
        timestamp: Some(row.get(9)?),
        committed: row.get(10)?,
    })
}

fn select_commits(conn: &Connection, filter: &CommitFilter, order: &str) -> Result<Vec<Commit>> {
    let mut sql = format!("SELECT {} FROM commits WHERE stage_id = ?", COMMIT_COLUMNS);
    let mut values: Vec<rusqlite::types::Value> =
        vec![stage_key(filter.stage_id.as_deref()).to_string().into()];

    let columns = [
        ("committer", &filter.committer),
        ("context", &filter.context_id),
        ("domain_id", &filter.domain_id),
        ("connector_id", &filter.connector_id),
        ("instance_id", &filter.instance_id),
    ];
    for (column, value) in columns {
        if let Some(value) = value {
            sql.push_str(&format!(" AND {} = ?", column));
            values.push(value.clone().into());
        }
    }
    if let Some(timestamp) = filter.timestamp {
        sql.push_str(" AND timestamp <= ?");
        values.push(timestamp.into());
    }
    sql.push(' ');
    sql.push_str(order);

    let mut stmt = conn.prepare(&sql)?;
    let commits = stmt
        .query_map(params_from_iter(values.iter()), commit_from_row)?
        .collect::<rusqlite::Result<Vec<Commit>>>()?;

    commits
        .into_iter()
        .map(|c| with_write_set(conn, c))
        .collect()
}

fn with_write_set(conn: &Connection, mut commit: Commit) -> Result<Commit> {
    let revision = commit.revision.to_string();

    let mut stmt = conn.prepare_cached(
        "SELECT r.id, r.oid, r.stage_id, r.timestamp, r.deleted, c.kind FROM commit_records c
         JOIN records r ON r.id = c.record_id
         WHERE c.revision = ?1 ORDER BY c.kind ASC, c.position ASC",
    )?;
    let rows = stmt
        .query_map(params![revision], |row| {
            let (id, record) = record_from_row(row)?;
            let kind: String = row.get(5)?;
            Ok((id, record, kind))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (id, record, kind) in rows {
        let record = with_entries(conn, id, record)?;
        if kind == "insert" {
            commit.inserts.push(record);
        } else {
            commit.updates.push(record);
        }
    }

    let mut stmt = conn.prepare_cached(
        "SELECT oid FROM commit_deletions WHERE revision = ?1 ORDER BY position ASC",
    )?;
    commit.deletions = stmt
        .query_map(params![revision], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(commit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(mut commit: Commit, timestamp: i64) -> Commit {
        commit.timestamp = Some(timestamp);
        commit.committed = true;
        for record in commit.inserts.iter_mut().chain(commit.updates.iter_mut()) {
            record.timestamp = timestamp;
            record.stage_id = commit.stage_id.clone();
        }
        commit
    }

    #[test]
    fn test_storage_initialization() {
        let repo = SqliteRepository::in_memory().unwrap();
        assert_eq!(repo.last_timestamp().unwrap(), None);
        assert!(repo.conn().unwrap().is_autocommit());
    }

    #[test]
    fn test_commit_roundtrip() {
        let repo = SqliteRepository::in_memory().unwrap();
        let mut commit = Commit::new("alice", "ctx").with_comment("first");
        commit
            .insert(
                Record::new("a")
                    .with_entry("name", "foo")
                    .with_entry("size", 3i64)
                    .with_entry("blob", vec![1u8, 2, 3]),
            )
            .insert(Record::new("b"));
        let commit = committed(commit, 10);

        repo.write_commit(&commit, &[]).unwrap();

        let loaded = repo.commit_by_revision(&commit.revision).unwrap().unwrap();
        assert_eq!(loaded.committer, "alice");
        assert_eq!(loaded.comment.as_deref(), Some("first"));
        assert_eq!(loaded.timestamp, Some(10));
        assert!(loaded.committed);
        assert_eq!(loaded.inserts, commit.inserts);
        assert_eq!(repo.last_timestamp().unwrap(), Some(10));
    }

    #[test]
    fn test_latest_record_and_head() {
        let repo = SqliteRepository::in_memory().unwrap();
        let mut first = Commit::new("alice", "ctx");
        first.insert(Record::new("a").with_entry("name", "foo"));
        repo.write_commit(&committed(first, 10), &[]).unwrap();

        let mut second = Commit::new("alice", "ctx");
        second.delete("a");
        let second = committed(second, 20);
        repo.write_commit(&second, &[Record::tombstone("a", 20, None)])
            .unwrap();

        let at_ten = repo.latest_record("a", None, 10).unwrap().unwrap();
        assert!(!at_ten.deleted);
        let at_twenty = repo.latest_record("a", None, 25).unwrap().unwrap();
        assert!(at_twenty.deleted);
        assert!(repo.latest_record("a", None, 5).unwrap().is_none());

        assert_eq!(repo.head_records(15, None).unwrap().len(), 1);
        assert!(repo.head_records(20, None).unwrap().is_empty());
        assert_eq!(repo.history("a", None, None, None).unwrap().len(), 2);
        assert_eq!(
            repo.commit_by_revision(&second.revision)
                .unwrap()
                .unwrap()
                .deletions,
            vec!["a".to_string()]
        );
    }

    #[test]
    fn test_stage_partitions_are_separate() {
        let repo = SqliteRepository::in_memory().unwrap();
        let mut staged = Commit::new("alice", "ctx").with_stage("s1");
        staged.insert(Record::new("a"));
        repo.write_commit(&committed(staged, 10), &[]).unwrap();

        assert!(repo.latest_record("a", None, 10).unwrap().is_none());
        assert!(repo.latest_record("a", Some("s1"), 10).unwrap().is_some());
        assert!(repo.latest_commit(&CommitFilter::new()).unwrap().is_none());
        assert!(repo
            .latest_commit(&CommitFilter::new().stage(Some("s1")))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let repo = SqliteRepository::in_memory().unwrap();
        let mut commit = Commit::new("alice", "ctx");
        commit.insert(Record::new("a")).insert(Record::new("a"));

        assert!(repo.write_commit(&committed(commit, 10), &[]).is_err());
        assert_eq!(repo.last_timestamp().unwrap(), None);
        assert!(repo.history("a", None, None, None).unwrap().is_empty());
    }

    #[test]
    fn test_commit_filter_sql() {
        let repo = SqliteRepository::in_memory().unwrap();
        let alice = committed(Commit::new("alice", "ctx-1"), 10);
        let bob = committed(Commit::new("bob", "ctx-2").with_domain("d"), 20);
        repo.write_commit(&alice, &[]).unwrap();
        repo.write_commit(&bob, &[]).unwrap();

        assert_eq!(repo.commits(&CommitFilter::new()).unwrap().len(), 2);
        let bobs = repo.commits(&CommitFilter::new().committer("bob")).unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].domain_id.as_deref(), Some("d"));
        assert!(repo
            .commits(&CommitFilter::new().committer("bob").up_to(15))
            .unwrap()
            .is_empty());
        let latest = repo.latest_commit(&CommitFilter::new()).unwrap().unwrap();
        assert_eq!(latest.revision, bob.revision);
    }

    #[test]
    fn test_on_disk_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("edb.db");
        {
            let repo = SqliteRepository::new(&path).unwrap();
            let mut commit = Commit::new("alice", "ctx");
            commit.insert(Record::new("a").with_entry("k", "v"));
            repo.write_commit(&committed(commit, 10), &[]).unwrap();
        }

        let reopened = SqliteRepository::new(&path).unwrap();
        let record = reopened.latest_record("a", None, 10).unwrap().unwrap();
        assert_eq!(record.get("k"), Some(&Value::from("v")));
    }
}
