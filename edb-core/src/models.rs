use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Entry key holding the per-object optimistic locking counter.
pub const MODEL_VERSION: &str = "modelVersion";

/// Keys maintained by the store itself; never reported as differences.
pub const BOOKKEEPING_KEYS: [&str; 4] = ["_id", "@prevTimestamp", "@timestamp", MODEL_VERSION];

pub fn is_bookkeeping_key(key: &str) -> bool {
    BOOKKEEPING_KEYS.contains(&key)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Text form used by the entries table and by value comparisons.
    pub fn encode(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Bytes(bytes) => hex::encode(bytes),
        }
    }

    pub fn decode(type_tag: &str, text: &str) -> Result<Self> {
        let invalid = || Error::InvalidValue(format!("{:?} is not a valid {}", text, type_tag));
        match type_tag {
            "string" => Ok(Value::String(text.to_string())),
            "int" => text.parse().map(Value::Int).map_err(|_| invalid()),
            "float" => text.parse().map(Value::Float).map_err(|_| invalid()),
            "bool" => text.parse().map(Value::Bool).map_err(|_| invalid()),
            "bytes" => hex::decode(text).map(Value::Bytes).map_err(|_| invalid()),
            other => Err(Error::InvalidValue(format!("unknown type tag {}", other))),
        }
    }

    /// Values are compared the way they are stored: by their text form.
    pub fn same_as(&self, other: &Value) -> bool {
        self == other || self.encode() == other.encode()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Reads an integer given either natively or as numeric text.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::String(s) => s.trim().parse().ok(),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .or_else(|| n.as_f64().map(Value::Float))
                .ok_or_else(|| Error::InvalidValue(n.to_string())),
            other => Err(Error::InvalidValue(format!(
                "only scalar values can be stored, got {}",
                other
            ))),
        }
    }
}

/// Floats compare by bit pattern, so a NaN field equals itself.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

/// One version of an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub oid: String,
    pub entries: BTreeMap<String, Value>,
    pub deleted: bool,
    pub timestamp: i64,
    pub stage_id: Option<String>,
}

impl Record {
    pub fn new(oid: impl Into<String>) -> Self {
        Self {
            oid: oid.into(),
            entries: BTreeMap::new(),
            deleted: false,
            timestamp: 0,
            stage_id: None,
        }
    }

    pub fn tombstone(oid: impl Into<String>, timestamp: i64, stage_id: Option<String>) -> Self {
        Self {
            deleted: true,
            timestamp,
            stage_id,
            ..Self::new(oid)
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// The optimistic locking version carried by this record, if any.
    pub fn model_version(&self) -> Result<Option<i64>> {
        match self.entries.get(MODEL_VERSION) {
            None => Ok(None),
            Some(value) => value.as_int().map(Some).ok_or_else(|| {
                Error::InvalidValue(format!(
                    "{} of {} is not a number: {}",
                    MODEL_VERSION, self.oid, value
                ))
            }),
        }
    }

    pub fn set_model_version(&mut self, version: i64) {
        self.entries
            .insert(MODEL_VERSION.to_string(), Value::Int(version));
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// An atomic batch of inserts, updates and deletions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub revision: Uuid,
    pub parent_revision: Option<Uuid>,
    pub committer: String,
    pub context_id: String,
    pub domain_id: Option<String>,
    pub connector_id: Option<String>,
    pub instance_id: Option<String>,
    pub comment: Option<String>,
    pub stage_id: Option<String>,
    pub inserts: Vec<Record>,
    pub updates: Vec<Record>,
    pub deletions: Vec<String>,
    pub committed: bool,
    pub timestamp: Option<i64>,
}

impl Commit {
    pub fn new(committer: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            revision: Uuid::new_v4(),
            parent_revision: None,
            committer: committer.into(),
            context_id: context_id.into(),
            domain_id: None,
            connector_id: None,
            instance_id: None,
            comment: None,
            stage_id: None,
            inserts: Vec::new(),
            updates: Vec::new(),
            deletions: Vec::new(),
            committed: false,
            timestamp: None,
        }
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_revision = Some(parent);
        self
    }

    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_domain(mut self, domain_id: impl Into<String>) -> Self {
        self.domain_id = Some(domain_id.into());
        self
    }

    pub fn with_connector(mut self, connector_id: impl Into<String>) -> Self {
        self.connector_id = Some(connector_id.into());
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn insert(&mut self, record: Record) -> &mut Self {
        self.inserts.push(record);
        self
    }

    pub fn update(&mut self, record: Record) -> &mut Self {
        self.updates.push(record);
        self
    }

    pub fn delete(&mut self, oid: impl Into<String>) -> &mut Self {
        self.deletions.push(oid.into());
        self
    }

    pub fn insert_all(&mut self, records: impl IntoIterator<Item = Record>) -> &mut Self {
        self.inserts.extend(records);
        self
    }

    pub fn update_all(&mut self, records: impl IntoIterator<Item = Record>) -> &mut Self {
        self.updates.extend(records);
        self
    }

    pub fn delete_all<S: Into<String>>(&mut self, oids: impl IntoIterator<Item = S>) -> &mut Self {
        self.deletions.extend(oids.into_iter().map(Into::into));
        self
    }

    /// Inserted and updated records, in that order.
    pub fn objects(&self) -> impl Iterator<Item = &Record> {
        self.inserts.iter().chain(self.updates.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }

    /// True if this commit wrote a version of `oid`.
    pub fn touches(&self, oid: &str) -> bool {
        self.objects().any(|r| r.oid == oid) || self.deletions.iter().any(|d| d == oid)
    }

    pub fn meta_info(&self) -> CommitMetaInfo {
        CommitMetaInfo {
            revision: self.revision,
            parent_revision: self.parent_revision,
            committer: self.committer.clone(),
            context_id: self.context_id.clone(),
            comment: self.comment.clone(),
            domain_id: self.domain_id.clone(),
            connector_id: self.connector_id.clone(),
            instance_id: self.instance_id.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Commit metadata without its write set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMetaInfo {
    pub revision: Uuid,
    pub parent_revision: Option<Uuid>,
    pub committer: String,
    pub context_id: String,
    pub comment: Option<String>,
    pub domain_id: Option<String>,
    pub connector_id: Option<String>,
    pub instance_id: Option<String>,
    pub timestamp: Option<i64>,
}

/// The live objects of one stage as of a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Head {
    pub timestamp: i64,
    pub stage_id: Option<String>,
    pub objects: BTreeMap<String, Record>,
}

impl Head {
    pub fn new(timestamp: i64, stage_id: Option<String>, records: Vec<Record>) -> Self {
        let objects = records
            .into_iter()
            .filter(Record::is_live)
            .map(|r| (r.oid.clone(), r))
            .collect();
        Self {
            timestamp,
            stage_id,
            objects,
        }
    }

    pub fn get(&self, oid: &str) -> Option<&Record> {
        self.objects.get(oid)
    }

    pub fn contains(&self, oid: &str) -> bool {
        self.objects.contains_key(oid)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn oids(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.objects.values()
    }
}

/// A history entry paired with the commit that wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub commit: Commit,
    pub record: Record,
}
