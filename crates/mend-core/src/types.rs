//! Core data model
//!
//! Records flowing from parser call sites into the failure queue, the
//! cluster analysis handed back by the clustering collaborator, generated
//! code artifacts, and the ledger entry written for exhausted batches.

use crate::ids::{BatchId, ClusterId, Generation, SequenceIndex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// A parse failure as reported by a call site, before the queue numbers it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFailure {
    /// The text the parser could not interpret
    pub input_text: String,
    /// When the failure happened (queue fills in `now` if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    /// Opaque auxiliary payload
    #[serde(default)]
    pub context: serde_json::Value,
}

impl NewFailure {
    /// Failure with no context and no timestamp
    #[inline]
    #[must_use]
    pub fn new(input_text: impl Into<String>) -> Self {
        Self {
            input_text: input_text.into(),
            observed_at: None,
            context: serde_json::Value::Null,
        }
    }

    /// Attach a context payload
    #[inline]
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Pin the observation time
    #[inline]
    #[must_use]
    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }
}

/// One observed parse failure, numbered by the queue
///
/// Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub sequence_index: SequenceIndex,
    pub input_text: String,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Point-in-time view of the queue
///
/// `records` are ordered by `sequence_index`. `fence` is the highest index
/// included, or `None` when the queue was empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueueSnapshot {
    pub records: Vec<FailureRecord>,
    pub fence: Option<SequenceIndex>,
}

impl QueueSnapshot {
    /// Build from records, computing the fence
    #[must_use]
    pub fn new(mut records: Vec<FailureRecord>) -> Self {
        records.sort_by_key(|r| r.sequence_index);
        let fence = records.last().map(|r| r.sequence_index);
        Self { records, fence }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up a record by index
    #[must_use]
    pub fn get(&self, index: SequenceIndex) -> Option<&FailureRecord> {
        self.records
            .binary_search_by_key(&index, |r| r.sequence_index)
            .ok()
            .map(|pos| &self.records[pos])
    }

    /// Whether `index` is part of this snapshot
    #[inline]
    #[must_use]
    pub fn contains(&self, index: SequenceIndex) -> bool {
        self.get(index).is_some()
    }

    /// All indices, ascending
    #[must_use]
    pub fn indices(&self) -> BTreeSet<SequenceIndex> {
        self.records.iter().map(|r| r.sequence_index).collect()
    }
}

/// Estimated likelihood that generated code can handle a cluster
///
/// Declaration order is priority order: `Parsable` ranks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parsability {
    Parsable,
    ContextDependent,
    Ambiguous,
}

impl Parsability {
    /// Priority rank, lower is better
    #[inline]
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Parsable => 0,
            Self::ContextDependent => 1,
            Self::Ambiguous => 2,
        }
    }
}

/// A group of similar failures found by the clustering collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCluster {
    pub cluster_id: ClusterId,
    pub member_indices: Vec<SequenceIndex>,
    #[serde(default)]
    pub commonality: String,
    #[serde(default)]
    pub examples: Vec<String>,
    pub parsability: Parsability,
}

impl ErrorCluster {
    /// Cluster with no description or examples
    #[must_use]
    pub fn new(
        cluster_id: ClusterId,
        member_indices: impl IntoIterator<Item = SequenceIndex>,
        parsability: Parsability,
    ) -> Self {
        Self {
            cluster_id,
            member_indices: member_indices.into_iter().collect(),
            commonality: String::new(),
            examples: Vec::new(),
            parsability,
        }
    }

    #[must_use]
    pub fn with_commonality(mut self, commonality: impl Into<String>) -> Self {
        self.commonality = commonality.into();
        self
    }

    #[must_use]
    pub fn with_examples(mut self, examples: Vec<String>) -> Self {
        self.examples = examples;
        self
    }
}

/// Generated module and test source for one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeArtifact {
    pub cluster_id: ClusterId,
    pub module_source: String,
    pub test_source: String,
    /// Assigned by the registry at install time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
}

impl CodeArtifact {
    /// Uninstalled artifact
    #[must_use]
    pub fn new(
        cluster_id: ClusterId,
        module_source: impl Into<String>,
        test_source: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id,
            module_source: module_source.into(),
            test_source: test_source.into(),
            generation: None,
        }
    }

    /// Copy stamped with the generation it was installed in
    #[must_use]
    pub fn installed_in(&self, generation: Generation) -> Self {
        Self {
            generation: Some(generation),
            ..self.clone()
        }
    }

    /// SHA-256 over module and test source, hex encoded
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.cluster_id.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.module_source.as_bytes());
        hasher.update([0]);
        hasher.update(self.test_source.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Short description of an installed module, given to code generation as
/// context so it can avoid duplicating existing coverage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub cluster_id: ClusterId,
    pub description: String,
}

/// Persisted facts about a batch that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatchEntry {
    pub batch_id: BatchId,
    pub clusters: Vec<ClusterId>,
    pub retry_count: u32,
    pub last_test_output: String,
    pub timestamp: DateTime<Utc>,
    /// Total member records across the batch's clusters
    #[serde(default)]
    pub error_count: usize,
    /// First few records of each cluster, for human review
    #[serde(default)]
    pub error_samples: Vec<FailureRecord>,
}
