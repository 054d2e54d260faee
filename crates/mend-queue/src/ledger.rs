//! Failed-batch ledger
//!
//! Append-only JSON-lines record of batches that exhausted their retries,
//! kept for human review. Nothing in the pipeline reads it back.

use crate::error::LedgerError;
use crate::jsonl;
use mend_core::FailedBatchEntry;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Durable log of exhausted batches
#[derive(Debug)]
pub struct FailedBatchLedger {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FailedBatchLedger {
    /// Open (or create the directory for) the ledger at `path`
    ///
    /// # Errors
    /// `LedgerError::Io` if the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        std::fs::create_dir_all(jsonl::parent_dir(&path))?;
        Ok(Self {
            path,
            guard: Mutex::new(()),
        })
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry; returns after it is synced to disk
    ///
    /// # Errors
    /// `LedgerError` if the entry cannot be encoded or written.
    pub fn append(&self, entry: &FailedBatchEntry) -> Result<(), LedgerError> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.guard.lock();
        jsonl::append_line(&self.path, &line)?;
        info!(
            "Recorded failed batch {} ({} clusters, {} retries)",
            entry.batch_id,
            entry.clusters.len(),
            entry.retry_count
        );
        Ok(())
    }

    /// Every well-formed entry in append order; malformed lines are skipped
    ///
    /// # Errors
    /// `LedgerError::Io` if the file exists but cannot be read.
    pub fn entries(&self) -> Result<Vec<FailedBatchEntry>, LedgerError> {
        let lines = {
            let _guard = self.guard.lock();
            jsonl::read_lines(&self.path)?
        };

        let mut entries = Vec::with_capacity(lines.len());
        for (pos, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping ledger line {}: {}", pos + 1, e),
            }
        }
        Ok(entries)
    }

    /// Number of well-formed entries
    ///
    /// # Errors
    /// Same as [`FailedBatchLedger::entries`].
    pub fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.entries()?.len())
    }

    /// # Errors
    /// Same as [`FailedBatchLedger::entries`].
    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }
}
