//! # edb-core
//!
//! Core library for edb - a versioned object store for engineering data.
//!
//! Objects are identified by an oid and never overwritten: every commit
//! appends new versions, and the state of the store at any past time can be
//! reconstructed as a [`Head`]. Commits pass through ordered hooks, the
//! first of which checks model versions for conflicting updates.

pub mod checker;
pub mod config;
pub mod diff;
pub mod error;
pub mod hooks;
pub mod memory;
pub mod models;
pub mod query;
pub mod service;
pub mod storage;

pub use checker::CheckPreCommitHook;
pub use config::EdbConfig;
pub use diff::{Diff, EntryDiff, ObjectDiff};
pub use error::{ConflictReport, Error, HookError, HookResult, Result};
pub use hooks::{
    AuthContext, BeginCommitHook, ContextHolder, ErrorHook, PostCommitHook, PreCommitHook,
    StaticIdentity,
};
pub use memory::MemoryRepository;
pub use models::{Commit, CommitMetaInfo, Head, LogEntry, Record, Value, MODEL_VERSION};
pub use query::{CommitFilter, CommitQuery, QueryRequest};
pub use service::{EdbService, EdbServiceBuilder};
pub use storage::{Repository, SqliteRepository};
