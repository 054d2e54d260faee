//! In-memory state of one batch
//!
//! A [`WorkflowRun`] lives for one `run_batch` call. On success it is
//! dropped; on exhaustion its essentials become a [`FailedBatchEntry`].

use crate::collaborators::{ClusterPlan, TestReport};
use crate::error::AttemptFailure;
use crate::state_machine::{next_state, StepOutcome, TransitionError, WorkflowState};
use chrono::{DateTime, Utc};
use mend_core::{
    BatchId, ClusterId, CodeArtifact, ErrorCluster, FailedBatchEntry, FailureRecord, QueueSnapshot,
    SequenceIndex,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Records per cluster copied into a ledger entry
pub const LEDGER_SAMPLES_PER_CLUSTER: usize = 3;

/// One PLAN → ACT → VALIDATE pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// 1-based
    pub attempt: u32,
    /// `None` if the attempt passed
    pub failure: Option<AttemptFailure>,
    /// Test output, or the failure message when no tests ran
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// A batch in flight
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub batch_id: BatchId,
    pub state: WorkflowState,
    /// Failed attempts so far
    pub retry_count: u32,
    pub snapshot: QueueSnapshot,
    /// Selected clusters, in selection order; fixed for the whole batch
    pub clusters: Vec<ErrorCluster>,
    pub plans: Vec<ClusterPlan>,
    pub artifacts: BTreeMap<ClusterId, CodeArtifact>,
    pub last_report: Option<TestReport>,
    pub attempts: Vec<AttemptRecord>,
}

impl WorkflowRun {
    /// Run in REASON over `snapshot`
    #[must_use]
    pub fn new(batch_id: BatchId, snapshot: QueueSnapshot) -> Self {
        Self {
            batch_id,
            state: WorkflowState::Reason,
            retry_count: 0,
            snapshot,
            clusters: Vec::new(),
            plans: Vec::new(),
            artifacts: BTreeMap::new(),
            last_report: None,
            attempts: Vec::new(),
        }
    }

    /// Apply one transition from the table
    ///
    /// # Errors
    /// `TransitionError` if `outcome` is illegal in the current state.
    pub fn advance(&mut self, outcome: StepOutcome) -> Result<WorkflowState, TransitionError> {
        let next = next_state(self.state, outcome)?;
        debug!(
            "Batch {}: {:?} --{:?}--> {:?}",
            self.batch_id, self.state, outcome, next
        );
        self.state = next;
        Ok(next)
    }

    /// Number of the attempt about to run or running
    #[inline]
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    #[must_use]
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.clusters.iter().map(|c| c.cluster_id.clone()).collect()
    }

    /// Union of member indices over the selected clusters
    #[must_use]
    pub fn member_indices(&self) -> BTreeSet<SequenceIndex> {
        self.clusters
            .iter()
            .flat_map(|c| c.member_indices.iter().copied())
            .collect()
    }

    /// Snapshot records belonging to the selected clusters, by index
    #[must_use]
    pub fn member_records(&self) -> Vec<FailureRecord> {
        self.member_indices()
            .into_iter()
            .filter_map(|i| self.snapshot.get(i).cloned())
            .collect()
    }

    /// What the previous attempt left for the next PLAN
    #[must_use]
    pub fn feedback(&self) -> Option<String> {
        self.attempts
            .last()
            .filter(|a| a.failure.is_some())
            .map(|a| a.output.clone())
    }

    /// Close out an attempt
    pub fn record_attempt(
        &mut self,
        started_at: DateTime<Utc>,
        failure: Option<AttemptFailure>,
        report: Option<&TestReport>,
    ) {
        let output = match (report, &failure) {
            (Some(report), Some(AttemptFailure::TestsFailed { .. }) | None) => {
                report.raw_output.clone()
            }
            (_, Some(failure)) => failure.to_string(),
            (None, None) => String::new(),
        };
        self.attempts.push(AttemptRecord {
            attempt: self.attempt(),
            failure,
            output,
            started_at,
            finished_at: Utc::now(),
        });
    }

    /// Ledger entry for an exhausted batch
    #[must_use]
    pub fn ledger_entry(&self) -> FailedBatchEntry {
        let error_samples = self
            .clusters
            .iter()
            .flat_map(|c| {
                c.member_indices
                    .iter()
                    .filter_map(|i| self.snapshot.get(*i).cloned())
                    .take(LEDGER_SAMPLES_PER_CLUSTER)
            })
            .collect();

        FailedBatchEntry {
            batch_id: self.batch_id,
            clusters: self.cluster_ids(),
            retry_count: self.retry_count,
            last_test_output: self
                .attempts
                .last()
                .map(|a| a.output.clone())
                .unwrap_or_default(),
            timestamp: Utc::now(),
            error_count: self.member_indices().len(),
            error_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_core::Parsability;
    use pretty_assertions::assert_eq;

    fn run_with_members(members: &[&[u64]]) -> WorkflowRun {
        let records = (0..10)
            .map(|i| FailureRecord {
                sequence_index: SequenceIndex(i),
                input_text: format!("in {i} days"),
                observed_at: Utc::now(),
                context: serde_json::Value::Null,
            })
            .collect();
        let mut run = WorkflowRun::new(BatchId::new(), QueueSnapshot::new(records));
        run.clusters = members
            .iter()
            .enumerate()
            .map(|(n, m)| {
                ErrorCluster::new(
                    ClusterId::new(format!("cluster_{n}")).unwrap(),
                    m.iter().copied().map(SequenceIndex),
                    Parsability::Parsable,
                )
            })
            .collect();
        run
    }

    #[test]
    fn ledger_entry_samples_and_counts() {
        let mut run = run_with_members(&[&[0, 1, 2, 3, 4], &[4, 5]]);
        run.retry_count = 3;
        run.record_attempt(Utc::now(), Some(AttemptFailure::TestsFailed { failed: 1 }), Some(&TestReport {
            all_passed: false,
            per_test_results: Vec::new(),
            raw_output: "1 passed, 1 failed".to_string(),
        }));

        let entry = run.ledger_entry();
        assert_eq!(entry.retry_count, 3);
        assert_eq!(entry.error_count, 6);
        assert_eq!(entry.error_samples.len(), 5);
        assert_eq!(entry.last_test_output, "1 passed, 1 failed");
        assert_eq!(entry.clusters.len(), 2);
    }

    #[test]
    fn feedback_comes_from_failed_attempt() {
        let mut run = run_with_members(&[&[0]]);
        assert_eq!(run.feedback(), None);
        run.record_attempt(
            Utc::now(),
            Some(AttemptFailure::Planning {
                message: "empty plan".to_string(),
            }),
            None,
        );
        assert_eq!(run.feedback().as_deref(), Some("planning failed: empty plan"));
    }

    #[test]
    fn illegal_advance_is_an_error() {
        let mut run = run_with_members(&[&[0]]);
        assert!(run.advance(StepOutcome::Passed).is_err());
        assert_eq!(run.state, WorkflowState::Reason);
    }
}
