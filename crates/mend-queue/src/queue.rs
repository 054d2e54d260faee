//! Durable failure queue
//!
//! - Append-only JSON-lines store, one [`FailureRecord`] per line
//! - `<store>.seq` sidecar holds the next sequence index. It is advanced
//!   before the record is written, so an index is never handed out twice,
//!   including after the queue drains or the process restarts
//! - `<store>.lock` is held (advisory, exclusive) for every operation so
//!   appends from other processes cannot interleave with a rewrite
//! - Lines written by other producers without an index are numbered on the
//!   next snapshot, in file order

use crate::error::QueueError;
use crate::jsonl;
use chrono::{DateTime, Utc};
use mend_core::{FailureRecord, NewFailure, QueueCorruption, QueueSnapshot, SequenceIndex};
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of a fenced removal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    /// Records actually deleted
    pub removed: usize,
    /// Requested indices above the fence; left in place
    pub beyond_fence: Vec<SequenceIndex>,
    /// Requested indices at or below the fence that were already gone
    pub already_absent: Vec<SequenceIndex>,
}

/// Persistent, append-only store of parse failures
#[derive(Debug)]
pub struct FailureQueue {
    path: PathBuf,
    seq_path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl FailureQueue {
    /// Open (or create) the queue stored at `path`
    ///
    /// Reconciles the sequence sidecar with the store so the next index is
    /// above every index already present.
    ///
    /// # Errors
    /// `QueueError` if the store directory, lock, or sidecar is unusable.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        std::fs::create_dir_all(jsonl::parent_dir(&path))?;

        let queue = Self {
            seq_path: sidecar(&path, "seq"),
            lock_path: sidecar(&path, "lock"),
            path,
            guard: Mutex::new(()),
        };

        let (records, next) = {
            let _lock = queue.lock()?;
            let lines = scan(&jsonl::read_lines(&queue.path)?);
            let next = queue.next_index(&lines)?;
            if queue.load_next()? != Some(next) {
                queue.store_next(next)?;
            }
            (lines.iter().filter(|l| l.is_record()).count(), next)
        };

        info!(
            "Opened failure queue: {} ({} records, next index {})",
            queue.path.display(),
            records,
            next
        );
        Ok(queue)
    }

    /// Location of the backing store
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably record a failure and return it with its assigned index
    ///
    /// Returns only after the record has been synced to disk.
    ///
    /// # Errors
    /// `QueueError` if the store cannot be written.
    pub fn append(&self, failure: NewFailure) -> Result<FailureRecord, QueueError> {
        let _lock = self.lock()?;

        let index = match self.load_next()? {
            Some(next) => next,
            None => self.next_index(&scan(&jsonl::read_lines(&self.path)?))?,
        };
        let record = FailureRecord {
            sequence_index: index,
            input_text: failure.input_text,
            observed_at: failure.observed_at.unwrap_or_else(Utc::now),
            context: failure.context,
        };
        let line = serde_json::to_string(&record)?;

        self.store_next(index.next())?;
        jsonl::append_line(&self.path, &line)?;

        debug!("Queued failure {}: {:?}", index, record.input_text);
        Ok(record)
    }

    /// Consistent view of every well-formed record, with its fence
    ///
    /// Malformed lines are logged and skipped. Unnumbered lines from other
    /// producers are numbered and rewritten first.
    ///
    /// # Errors
    /// `QueueError` if the store cannot be read or rewritten.
    pub fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let _lock = self.lock()?;
        let mut lines = scan(&jsonl::read_lines(&self.path)?);

        if lines.iter().any(ScannedLine::is_unnumbered) {
            self.adopt(&mut lines)?;
        }

        let records = lines
            .into_iter()
            .filter_map(|line| match line.kind {
                LineKind::Record(record) => Some(record),
                _ => None,
            })
            .collect();
        Ok(QueueSnapshot::new(records))
    }

    /// Remove the records in `indices` that are at or below `fence`
    ///
    /// Records appended after the snapshot that produced `fence` are never
    /// touched, even if their index appears in `indices`. Malformed lines
    /// are preserved verbatim. A `None` fence removes nothing.
    ///
    /// # Errors
    /// `QueueError` if the store cannot be read or rewritten.
    pub fn remove_fenced(
        &self,
        indices: &BTreeSet<SequenceIndex>,
        fence: Option<SequenceIndex>,
    ) -> Result<RemovalReport, QueueError> {
        let _lock = self.lock()?;

        let Some(fence) = fence else {
            return Ok(RemovalReport {
                beyond_fence: indices.iter().copied().collect(),
                ..RemovalReport::default()
            });
        };

        let lines = scan(&jsonl::read_lines(&self.path)?);
        let mut found = BTreeSet::new();
        let mut kept = Vec::with_capacity(lines.len());
        for line in &lines {
            match line.index() {
                Some(i) if i <= fence && indices.contains(&i) && line.is_record() => {
                    found.insert(i);
                }
                _ => kept.push(line.raw.as_str()),
            }
        }

        let report = RemovalReport {
            removed: found.len(),
            beyond_fence: indices
                .range((Bound::Excluded(fence), Bound::Unbounded))
                .copied()
                .collect(),
            already_absent: indices
                .range(..=fence)
                .filter(|i| !found.contains(i))
                .copied()
                .collect(),
        };

        if report.removed > 0 {
            jsonl::replace_lines(&self.path, kept)?;
        }
        if !report.beyond_fence.is_empty() {
            warn!(
                "Ignored {} removal requests beyond fence {}",
                report.beyond_fence.len(),
                fence
            );
        }
        info!(
            "Removed {} records from failure queue (fence {})",
            report.removed, fence
        );
        Ok(report)
    }

    /// Number of well-formed records
    ///
    /// # Errors
    /// Same as [`FailureQueue::snapshot`].
    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.snapshot()?.len())
    }

    /// Whether the queue holds no well-formed records
    ///
    /// # Errors
    /// Same as [`FailureQueue::snapshot`].
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> Result<StoreLock<'_>, QueueError> {
        let local = self.guard.lock();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        fs2::FileExt::lock_exclusive(&file).map_err(|source| QueueError::Lock {
            path: self.lock_path.clone(),
            source,
        })?;
        Ok(StoreLock {
            file,
            _local: local,
        })
    }

    fn load_next(&self) -> Result<Option<SequenceIndex>, QueueError> {
        let text = match std::fs::read_to_string(&self.seq_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<u64>()
            .map(|n| Some(SequenceIndex(n)))
            .map_err(|_| QueueError::CorruptSequence {
                path: self.seq_path.clone(),
                content: trimmed.to_string(),
            })
    }

    fn store_next(&self, next: SequenceIndex) -> Result<(), QueueError> {
        jsonl::replace_text(&self.seq_path, &next.0.to_string())?;
        Ok(())
    }

    /// Next free index: above both the sidecar and every stored index
    fn next_index(&self, lines: &[ScannedLine]) -> Result<SequenceIndex, QueueError> {
        let from_store = lines
            .iter()
            .filter_map(ScannedLine::index)
            .max()
            .map_or(SequenceIndex(0), SequenceIndex::next);
        let from_sidecar = self.load_next()?.unwrap_or(SequenceIndex(0));
        Ok(from_store.max(from_sidecar))
    }

    /// Number unnumbered lines in file order and rewrite the store
    fn adopt(&self, lines: &mut [ScannedLine]) -> Result<(), QueueError> {
        let mut next = self.next_index(lines)?;
        let now = Utc::now();
        let mut adopted = 0usize;

        for line in lines.iter_mut() {
            let LineKind::Unnumbered(stored) = &mut line.kind else {
                continue;
            };
            let sequence_index = match stored.sequence_index {
                Some(i) => i,
                None => {
                    let i = next;
                    next = next.next();
                    i
                }
            };
            let record = FailureRecord {
                sequence_index,
                input_text: std::mem::take(&mut stored.input_text),
                observed_at: stored.observed_at.unwrap_or(now),
                context: std::mem::take(&mut stored.context),
            };
            line.raw = serde_json::to_string(&record)?;
            line.kind = LineKind::Record(record);
            adopted += 1;
        }

        self.store_next(next)?;
        jsonl::replace_lines(&self.path, lines.iter().map(|l| l.raw.as_str()))?;
        info!("Adopted {} unnumbered failure records", adopted);
        Ok(())
    }
}

/// In-process and cross-process exclusion for one queue operation
struct StoreLock<'a> {
    file: File,
    _local: MutexGuard<'a, ()>,
}

impl Drop for StoreLock<'_> {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Lenient view of a stored line, for lines written by other producers
#[derive(Debug, Deserialize)]
struct StoredLine {
    #[serde(default)]
    sequence_index: Option<SequenceIndex>,
    input_text: String,
    #[serde(default)]
    observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    context: serde_json::Value,
}

#[derive(Debug)]
enum LineKind {
    Record(FailureRecord),
    Unnumbered(StoredLine),
    Malformed,
}

#[derive(Debug)]
struct ScannedLine {
    raw: String,
    kind: LineKind,
}

impl ScannedLine {
    fn index(&self) -> Option<SequenceIndex> {
        Self::index_of(&self.kind)
    }

    fn index_of(kind: &LineKind) -> Option<SequenceIndex> {
        match kind {
            LineKind::Record(r) => Some(r.sequence_index),
            LineKind::Unnumbered(s) => s.sequence_index,
            LineKind::Malformed => None,
        }
    }

    fn is_record(&self) -> bool {
        matches!(self.kind, LineKind::Record(_))
    }

    fn is_unnumbered(&self) -> bool {
        matches!(self.kind, LineKind::Unnumbered(_))
    }
}

/// Classify raw lines, logging the malformed ones
///
/// A second line reusing an index already seen is treated as malformed.
fn scan(raw: &[String]) -> Vec<ScannedLine> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(raw.len());

    for (pos, text) in raw.iter().enumerate() {
        if text.trim().is_empty() {
            continue;
        }
        let kind = match serde_json::from_str::<FailureRecord>(text) {
            Ok(record) => LineKind::Record(record),
            Err(strict) => match serde_json::from_str::<StoredLine>(text) {
                Ok(stored) => LineKind::Unnumbered(stored),
                Err(_) => {
                    report(pos, strict.to_string());
                    LineKind::Malformed
                }
            },
        };

        let kind = match ScannedLine::index_of(&kind) {
            Some(i) if !seen.insert(i) => {
                report(pos, format!("duplicate sequence index {i}"));
                LineKind::Malformed
            }
            _ => kind,
        };
        out.push(ScannedLine {
            raw: text.clone(),
            kind,
        });
    }
    out
}

fn report(pos: usize, reason: String) {
    let corruption = QueueCorruption {
        line: pos + 1,
        reason,
    };
    warn!("Skipping failure queue line: {}", corruption);
}

fn sidecar(path: &Path, ext: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| OsString::from("queue"), OsString::from);
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}
