//! Registry errors

use mend_core::{ClusterId, ModuleLoadError};
use std::path::PathBuf;

/// Reload or startup failure
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A candidate failed validation; the live generation is unchanged
    #[error(transparent)]
    Load(#[from] ModuleLoadError),

    #[error("plugin registry is shut down")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistryError {
    /// Whether candidate modules failed validation
    ///
    /// A shut-down registry is not a rejection: it says nothing about the
    /// modules offered to it.
    #[inline]
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Load(_))
    }
}

/// Plugin directory I/O failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("plugin store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// Rule test suite could not be loaded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SuiteError {
    #[error("malformed test suite for {cluster_id}: {message}")]
    Syntax { cluster_id: ClusterId, message: String },

    #[error("test suite for {0} has no cases")]
    Empty(ClusterId),
}
