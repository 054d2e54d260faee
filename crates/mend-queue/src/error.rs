//! Storage errors
//!
//! Everything here means the backing store itself is unusable. Malformed
//! individual lines are not errors; see [`mend_core::QueueCorruption`].

use std::path::PathBuf;

/// Failure queue storage error
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode queue record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not lock queue at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The sequence sidecar holds something other than an index
    #[error("corrupt sequence file {path}: {content:?}")]
    CorruptSequence { path: PathBuf, content: String },
}

/// Failed-batch ledger storage error
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode ledger entry: {0}")]
    Encode(#[from] serde_json::Error),
}
