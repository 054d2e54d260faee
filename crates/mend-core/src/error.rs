//! Error taxonomy shared across the pipeline
//!
//! Crate-specific errors (`QueueError`, `RegistryError`, `WorkflowError`)
//! wrap these where they cross a boundary:
//! - [`ModuleLoadError`]: candidate code failed validation; only that reload is aborted
//! - [`NoMatchError`]: no plugin recognized an input; returned to the caller
//! - [`QueueCorruption`]: one malformed stored line; logged and skipped
//! - [`ConfigError`]: configuration could not be loaded

use crate::ids::{ClusterId, InvalidClusterId};
use std::path::PathBuf;

/// Candidate module failed validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleLoadError {
    /// Module name is not a valid cluster id
    #[error(transparent)]
    InvalidClusterId(#[from] InvalidClusterId),

    /// Module or test source is empty
    #[error("empty {what} source for cluster {cluster_id}")]
    EmptySource {
        cluster_id: ClusterId,
        what: &'static str,
    },

    /// Source is not well-formed
    #[error("syntax error in module {cluster_id}: {message}")]
    Syntax { cluster_id: ClusterId, message: String },

    /// Source parsed but does not satisfy the plugin contract
    #[error("module {cluster_id} violates the plugin contract: {message}")]
    Contract { cluster_id: ClusterId, message: String },

    /// Instantiated plugin panicked during the smoke call
    #[error("module {cluster_id} panicked while being exercised: {message}")]
    Panicked { cluster_id: ClusterId, message: String },

    /// Two artifacts in one reload target the same cluster
    #[error("duplicate artifact for cluster {0} in one reload")]
    DuplicateCluster(ClusterId),
}

impl ModuleLoadError {
    /// Cluster the failure belongs to, when known
    #[must_use]
    pub fn cluster_id(&self) -> Option<&ClusterId> {
        match self {
            Self::InvalidClusterId(_) => None,
            Self::EmptySource { cluster_id, .. }
            | Self::Syntax { cluster_id, .. }
            | Self::Contract { cluster_id, .. }
            | Self::Panicked { cluster_id, .. }
            | Self::DuplicateCluster(cluster_id) => Some(cluster_id),
        }
    }
}

/// No plugin in the current generation recognized the input
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not parse time expression: {input}")]
pub struct NoMatchError {
    pub input: String,
}

impl NoMatchError {
    #[inline]
    #[must_use]
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// A stored queue line that could not be decoded
///
/// Never returned as an error; readers log it and move on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed record at line {line}: {reason}")]
pub struct QueueCorruption {
    /// 1-based line number in the backing store
    pub line: usize,
    pub reason: String,
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_load_error_display() {
        let err = ModuleLoadError::Syntax {
            cluster_id: ClusterId::new("relative_dates").unwrap(),
            message: "expected `=`".to_string(),
        };
        assert!(err.to_string().contains("relative_dates"));
        assert_eq!(err.cluster_id().map(ClusterId::as_str), Some("relative_dates"));
    }

    #[test]
    fn invalid_id_has_no_cluster() {
        let err: ModuleLoadError = ClusterId::new("Bad Id").unwrap_err().into();
        assert!(err.cluster_id().is_none());
    }

    #[test]
    fn no_match_display() {
        let err = NoMatchError::new("the day after the meeting");
        assert_eq!(
            err.to_string(),
            "could not parse time expression: the day after the meeting"
        );
    }
}
