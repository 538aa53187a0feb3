//! Extension points around [`EdbService::commit`](crate::EdbService::commit).
//!
//! Hooks are handed to the service at construction and run in registration
//! order, one at a time, on the caller's thread.
//!
//! - [`BeginCommitHook`]: first look at a commit; an [`HookError::Edb`] aborts it.
//! - [`PreCommitHook`]: validation; the first [`HookError::Edb`] skips the rest
//!   and routes the commit to the error hooks. Pre-commit hooks run inside the
//!   store's write section and must not call back into the service.
//! - [`ErrorHook`]: may hand back a replacement commit, which is committed instead.
//! - [`PostCommitHook`]: notification only; failures are logged.
//!
//! [`HookError::Unavailable`] is ignored at every stage and
//! [`HookError::Fault`] is logged and skipped.

use crate::error::{Error, HookResult};
use crate::models::Commit;

pub trait BeginCommitHook: Send + Sync {
    fn on_start_commit(&self, commit: &mut Commit) -> HookResult<()>;
}

pub trait PreCommitHook: Send + Sync {
    fn on_pre_commit(&self, commit: &mut Commit) -> HookResult<()>;
}

pub trait PostCommitHook: Send + Sync {
    fn on_post_commit(&self, commit: &Commit) -> HookResult<()>;
}

pub trait ErrorHook: Send + Sync {
    /// Returns a commit to persist in place of the failed one, if any.
    fn on_error(&self, commit: &Commit, error: &Error) -> HookResult<Option<Commit>>;
}

/// The four ordered hook lists of a service.
#[derive(Default)]
pub struct Hooks {
    pub begin_commit: Vec<Box<dyn BeginCommitHook>>,
    pub pre_commit: Vec<Box<dyn PreCommitHook>>,
    pub post_commit: Vec<Box<dyn PostCommitHook>>,
    pub error: Vec<Box<dyn ErrorHook>>,
}

/// Source of the authenticated principal stamped on new commits.
pub trait AuthContext: Send + Sync {
    fn authenticated_principal(&self) -> String;
}

/// Source of the context id stamped on new commits.
pub trait ContextHolder: Send + Sync {
    fn current_context_id(&self) -> String;
}

/// Fixed committer and context, for tools and tests.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    pub committer: String,
    pub context_id: String,
}

impl StaticIdentity {
    pub fn new(committer: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            committer: committer.into(),
            context_id: context_id.into(),
        }
    }
}

impl AuthContext for StaticIdentity {
    fn authenticated_principal(&self) -> String {
        self.committer.clone()
    }
}

impl ContextHolder for StaticIdentity {
    fn current_context_id(&self) -> String {
        self.context_id.clone()
    }
}
