use crate::models::{Commit, Record, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Equality predicates over object entries, all of which must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub parameters: BTreeMap<String, Value>,
    /// Query the head at this time instead of the current one.
    pub timestamp: Option<i64>,
    pub stage_id: Option<String>,
    pub case_sensitive: bool,
    /// Treat `%` and `_` in string parameters as `LIKE` wildcards.
    pub wildcard_aware: bool,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            parameters: BTreeMap::new(),
            timestamp: None,
            stage_id: None,
            case_sensitive: true,
            wildcard_aware: false,
        }
    }
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().and(key, value)
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn in_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn wildcard_aware(mut self) -> Self {
        self.wildcard_aware = true;
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.parameters.iter().all(|(key, expected)| {
            record
                .get(key)
                .is_some_and(|actual| self.value_matches(expected, actual))
        })
    }

    fn value_matches(&self, expected: &Value, actual: &Value) -> bool {
        let (mut pattern, mut text) = (expected.encode(), actual.encode());
        if !self.case_sensitive {
            pattern = pattern.to_lowercase();
            text = text.to_lowercase();
        }
        if self.wildcard_aware {
            like_match(&pattern, &text)
        } else {
            pattern == text
        }
    }
}

/// SQL `LIKE` matching: `%` matches any run, `_` exactly one character.
pub fn like_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '%')
}

/// Equality filter over commit metadata. Unset fields match anything,
/// except `stage_id`, which always selects one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitFilter {
    pub committer: Option<String>,
    pub context_id: Option<String>,
    pub domain_id: Option<String>,
    pub connector_id: Option<String>,
    pub instance_id: Option<String>,
    pub stage_id: Option<String>,
    /// Only commits at or before this time.
    pub timestamp: Option<i64>,
}

impl CommitFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committer(mut self, committer: impl Into<String>) -> Self {
        self.committer = Some(committer.into());
        self
    }

    pub fn context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn domain(mut self, domain_id: impl Into<String>) -> Self {
        self.domain_id = Some(domain_id.into());
        self
    }

    pub fn connector(mut self, connector_id: impl Into<String>) -> Self {
        self.connector_id = Some(connector_id.into());
        self
    }

    pub fn instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn stage(mut self, stage_id: Option<&str>) -> Self {
        self.stage_id = stage_id.map(str::to_string);
        self
    }

    pub fn up_to(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn matches(&self, commit: &Commit) -> bool {
        fn eq(filter: &Option<String>, actual: &Option<String>) -> bool {
            filter.is_none() || filter == actual
        }

        self.committer.as_ref().map_or(true, |c| *c == commit.committer)
            && self.context_id.as_ref().map_or(true, |c| *c == commit.context_id)
            && eq(&self.domain_id, &commit.domain_id)
            && eq(&self.connector_id, &commit.connector_id)
            && eq(&self.instance_id, &commit.instance_id)
            && self.stage_id == commit.stage_id
            && self
                .timestamp
                .map_or(true, |ts| commit.timestamp.is_some_and(|c| c <= ts))
    }
}

/// Committer/context filter over a closed timestamp window of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitQuery {
    pub committer: Option<String>,
    pub context_id: Option<String>,
    pub stage_id: Option<String>,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

impl Default for CommitQuery {
    fn default() -> Self {
        Self {
            committer: None,
            context_id: None,
            stage_id: None,
            start_timestamp: 0,
            end_timestamp: i64::MAX,
        }
    }
}

impl CommitQuery {
    /// The metadata part of this query as a [`CommitFilter`].
    pub fn filter(&self) -> CommitFilter {
        CommitFilter {
            committer: self.committer.clone(),
            context_id: self.context_id.clone(),
            stage_id: self.stage_id.clone(),
            ..CommitFilter::default()
        }
    }

    pub fn matches(&self, commit: &Commit) -> bool {
        self.filter().matches(commit)
            && commit
                .timestamp
                .is_some_and(|ts| ts >= self.start_timestamp && ts <= self.end_timestamp)
    }
}
