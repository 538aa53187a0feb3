use crate::models::{is_bookkeeping_key, Commit, Head, Record, Value};
use similar::{ChangeTag, TextDiff};
use std::collections::BTreeMap;

/// One differing entry: its value before and after.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDiff {
    pub before: Option<Value>,
    pub after: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct DiffLine {
    pub line_type: DiffLineType,
    pub content: String,
    pub old_line_number: Option<usize>,
    pub new_line_number: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffLineType {
    Context,
    Addition,
    Deletion,
}

impl EntryDiff {
    pub fn reversed(&self) -> Self {
        Self {
            before: self.after.clone(),
            after: self.before.clone(),
        }
    }

    /// Line diff of the text forms of both sides.
    pub fn render_text(&self) -> Vec<DiffLine> {
        let old_text = self.before.as_ref().map(Value::encode).unwrap_or_default();
        let new_text = self.after.as_ref().map(Value::encode).unwrap_or_default();
        compute_diff(&old_text, &new_text)
    }
}

fn compute_diff(old_text: &str, new_text: &str) -> Vec<DiffLine> {
    let diff = TextDiff::from_lines(old_text, new_text);
    let mut lines = Vec::new();
    let mut old_line_num = 1;
    let mut new_line_num = 1;

    for change in diff.iter_all_changes() {
        let (line_type, old_num, new_num) = match change.tag() {
            ChangeTag::Delete => {
                let num = old_line_num;
                old_line_num += 1;
                (DiffLineType::Deletion, Some(num), None)
            }
            ChangeTag::Insert => {
                let num = new_line_num;
                new_line_num += 1;
                (DiffLineType::Addition, None, Some(num))
            }
            ChangeTag::Equal => {
                let old_num = old_line_num;
                let new_num = new_line_num;
                old_line_num += 1;
                new_line_num += 1;
                (DiffLineType::Context, Some(old_num), Some(new_num))
            }
        };

        lines.push(DiffLine {
            line_type,
            content: change.to_string(),
            old_line_number: old_num,
            new_line_number: new_num,
        });
    }

    lines
}

/// Field-level difference of one object between two states. A missing side
/// means the object is absent (never inserted, or deleted) in that state.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDiff {
    pub oid: String,
    pub start: Option<Record>,
    pub end: Option<Record>,
    pub entries: BTreeMap<String, EntryDiff>,
}

impl ObjectDiff {
    pub fn new(oid: impl Into<String>, start: Option<Record>, end: Option<Record>) -> Self {
        let entries = entry_diffs(start.as_ref(), end.as_ref());
        Self {
            oid: oid.into(),
            start,
            end,
            entries,
        }
    }

    pub fn difference_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reversed(&self) -> Self {
        Self {
            oid: self.oid.clone(),
            start: self.end.clone(),
            end: self.start.clone(),
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.reversed()))
                .collect(),
        }
    }
}

/// Keys of `before` that vanished or changed, then keys new in `after`.
/// Bookkeeping keys are skipped on both sides.
pub fn entry_diffs(before: Option<&Record>, after: Option<&Record>) -> BTreeMap<String, EntryDiff> {
    let empty = BTreeMap::new();
    let before = before.map_or(&empty, |r| &r.entries);
    let after = after.map_or(&empty, |r| &r.entries);
    let mut diffs = BTreeMap::new();

    for (key, value) in before.iter().filter(|(k, _)| !is_bookkeeping_key(k)) {
        let other = after.get(key);
        if other != Some(value) {
            diffs.insert(
                key.clone(),
                EntryDiff {
                    before: Some(value.clone()),
                    after: other.cloned(),
                },
            );
        }
    }

    for (key, value) in after.iter().filter(|(k, _)| !is_bookkeeping_key(k)) {
        if !before.contains_key(key) {
            diffs.insert(
                key.clone(),
                EntryDiff {
                    before: None,
                    after: Some(value.clone()),
                },
            );
        }
    }

    diffs
}

/// Differences between two heads, always read from the earlier to the later
/// one whatever order they were given in.
#[derive(Debug, Clone)]
pub struct Diff {
    pub start_commit: Commit,
    pub end_commit: Commit,
    pub start_head: Head,
    pub end_head: Head,
    pub object_diffs: BTreeMap<String, ObjectDiff>,
}

impl Diff {
    pub fn new(first: (Commit, Head), second: (Commit, Head)) -> Self {
        let ((start_commit, start_head), (end_commit, end_head)) =
            if first.1.timestamp <= second.1.timestamp {
                (first, second)
            } else {
                (second, first)
            };

        let mut object_diffs = BTreeMap::new();
        for (oid, start) in &start_head.objects {
            let diff = ObjectDiff::new(oid.clone(), Some(start.clone()), end_head.get(oid).cloned());
            if !diff.is_empty() {
                object_diffs.insert(oid.clone(), diff);
            }
        }
        for (oid, end) in &end_head.objects {
            if start_head.contains(oid) {
                continue;
            }
            let diff = ObjectDiff::new(oid.clone(), None, Some(end.clone()));
            if !diff.is_empty() {
                object_diffs.insert(oid.clone(), diff);
            }
        }

        Self {
            start_commit,
            end_commit,
            start_head,
            end_head,
            object_diffs,
        }
    }

    /// Number of objects that differ.
    pub fn difference_count(&self) -> usize {
        self.object_diffs.len()
    }

    pub fn get(&self, oid: &str) -> Option<&ObjectDiff> {
        self.object_diffs.get(oid)
    }

    pub fn start_timestamp(&self) -> i64 {
        self.start_head.timestamp
    }

    pub fn end_timestamp(&self) -> i64 {
        self.end_head.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MODEL_VERSION;
    use similar_asserts::assert_eq;

    fn head(timestamp: i64, records: Vec<Record>) -> (Commit, Head) {
        let mut commit = Commit::new("alice", "ctx");
        commit.timestamp = Some(timestamp);
        (commit, Head::new(timestamp, None, records))
    }

    #[test]
    fn test_entry_diffs() {
        let before = Record::new("a")
            .with_entry("KeyA", "A1")
            .with_entry("KeyB", "B1")
            .with_entry("KeyC", "C1")
            .with_entry(MODEL_VERSION, 1i64);
        let after = Record::new("a")
            .with_entry("KeyA", "A2")
            .with_entry("KeyC", "C1")
            .with_entry("KeyD", "D1")
            .with_entry(MODEL_VERSION, 2i64);

        let diffs = entry_diffs(Some(&before), Some(&after));

        assert_eq!(diffs.len(), 3);
        assert_eq!(
            diffs["KeyA"],
            EntryDiff {
                before: Some(Value::from("A1")),
                after: Some(Value::from("A2"))
            }
        );
        assert_eq!(diffs["KeyB"].after, None);
        assert_eq!(diffs["KeyD"].before, None);
        assert!(!diffs.contains_key(MODEL_VERSION));
    }

    #[test]
    fn test_diff_orders_by_timestamp() {
        let early = head(10, vec![Record::new("a").with_entry("k", "1")]);
        let late = head(20, vec![Record::new("a").with_entry("k", "2")]);

        let forward = Diff::new(early.clone(), late.clone());
        let backward = Diff::new(late, early);

        assert_eq!(forward.start_timestamp(), 10);
        assert_eq!(backward.start_timestamp(), 10);
        assert_eq!(forward.object_diffs, backward.object_diffs);
        assert_eq!(
            forward.get("a").unwrap().entries["k"].before,
            Some(Value::from("1"))
        );
    }

    #[test]
    fn test_unchanged_objects_are_skipped() {
        let same = Record::new("same").with_entry("k", "v");
        let diff = Diff::new(
            head(10, vec![same.clone(), Record::new("gone").with_entry("k", "v")]),
            head(20, vec![same, Record::new("new").with_entry("k", "v")]),
        );

        assert_eq!(diff.difference_count(), 2);
        assert!(diff.get("same").is_none());
        assert!(diff.get("gone").unwrap().end.is_none());
        assert!(diff.get("new").unwrap().start.is_none());
    }

    #[test]
    fn test_unchanged_nan_field_is_not_a_difference() {
        let record = Record::new("x").with_entry("f", f64::NAN);
        let diff = Diff::new(
            head(10, vec![record.clone()]),
            head(20, vec![record, Record::new("y").with_entry("k", "v")]),
        );

        assert_eq!(diff.difference_count(), 1);
        assert!(diff.get("x").is_none());
        assert!(diff.get("y").is_some());
    }

    #[test]
    fn test_reversed_swaps_sides() {
        let before = Record::new("a").with_entry("k", "1");
        let after = Record::new("a").with_entry("k", "2").with_entry("n", "x");

        let forward = ObjectDiff::new("a", Some(before.clone()), Some(after.clone()));
        let backward = ObjectDiff::new("a", Some(after), Some(before));

        assert_eq!(forward.reversed(), backward);
    }

    #[test]
    fn test_render_text() {
        let entry = EntryDiff {
            before: Some(Value::from("line 1\nline 2\nline 3\n")),
            after: Some(Value::from("line 1\nline 2 modified\nline 3\nline 4\n")),
        };

        let lines = entry.render_text();

        assert!(lines.iter().any(|l| l.line_type == DiffLineType::Addition));
        assert!(lines.iter().any(|l| l.line_type == DiffLineType::Deletion));
        assert!(lines.iter().any(|l| l.line_type == DiffLineType::Context));
    }
}
