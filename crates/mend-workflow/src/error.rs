//! Workflow errors
//!
//! Two levels:
//! - [`AttemptFailure`]: one PLAN/ACT/VALIDATE attempt failed. Consumes a
//!   retry; never leaves the workflow.
//! - [`WorkflowError`]: the batch could not run at all, or storage failed.

use crate::collaborators::CollaboratorError;
use crate::state_machine::TransitionError;
use mend_core::ClusterId;
use mend_queue::{LedgerError, QueueError};
use mend_registry::{RegistryError, StoreError};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Why one attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptFailure {
    #[error("planning failed: {message}")]
    Planning { message: String },

    #[error("code generation failed: {message}")]
    Generation { message: String },

    #[error("no artifact generated for cluster {cluster_id}")]
    MissingArtifact { cluster_id: ClusterId },

    #[error("empty {what} source generated for cluster {cluster_id}")]
    EmptySource {
        cluster_id: ClusterId,
        what: &'static str,
    },

    #[error("{failed} tests failed")]
    TestsFailed { failed: usize },

    #[error("validation timed out after {}s", timeout.as_secs())]
    ValidationTimeout { timeout: Duration },

    #[error("test runner failed: {message}")]
    Runner { message: String },

    /// Tests passed but the registry rejected the artifacts
    #[error("reload rejected: {message}")]
    Reload { message: String },
}

/// Batch-level error
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Another batch holds the workflow
    #[error("a batch is already in progress")]
    BatchInProgress,

    /// The clustering collaborator failed; the batch was abandoned
    #[error("clustering failed: {0}")]
    Clustering(CollaboratorError),

    #[error("failure queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("plugin store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("staging error at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A storage call on the blocking pool panicked or was cancelled
    #[error("storage task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl WorkflowError {
    /// Storage is unusable or the registry is shut down; the process should stop
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Queue(_)
                | Self::Ledger(_)
                | Self::Store(_)
                | Self::Staging { .. }
                | Self::Blocking(_)
                | Self::Registry(RegistryError::Closed)
        )
    }
}

/// Internal: an attempt either fails (retry accounting) or aborts the batch
#[derive(Debug)]
pub(crate) enum AttemptError {
    Failed(AttemptFailure),
    Fatal(WorkflowError),
}

impl From<AttemptFailure> for AttemptError {
    fn from(failure: AttemptFailure) -> Self {
        Self::Failed(failure)
    }
}

impl From<WorkflowError> for AttemptError {
    fn from(e: WorkflowError) -> Self {
        Self::Fatal(e)
    }
}

impl From<TransitionError> for AttemptError {
    fn from(e: TransitionError) -> Self {
        Self::Fatal(e.into())
    }
}
