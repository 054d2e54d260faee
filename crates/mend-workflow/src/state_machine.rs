//! Workflow state machine
//!
//! Typed transition table `state × outcome → next state`:
//!
//! ```text
//! REASON ──Proceed──▶ PLAN ──Proceed──▶ ACT ──Proceed──▶ VALIDATE ──Passed──▶ SUCCESS
//!   │                  ▲                 │                  │
//!   Empty              └──────Retry──────┴──────Retry───────┘
//!   ▼                        (PLAN, ACT and VALIDATE all retry to PLAN)
//! IDLE                       Exhausted from PLAN, ACT or VALIDATE ──▶ FAILURE
//! ```

use serde::{Deserialize, Serialize};

/// Where a workflow run is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Reason,
    Plan,
    Act,
    Validate,
    Success,
    Failure,
    /// Nothing to do: empty queue or no usable clusters
    Idle,
}

impl WorkflowState {
    pub const ALL: [Self; 7] = [
        Self::Reason,
        Self::Plan,
        Self::Act,
        Self::Validate,
        Self::Success,
        Self::Failure,
        Self::Idle,
    ];

    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Idle)
    }
}

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepOutcome {
    /// Step finished; move to the next one
    Proceed,
    /// REASON found nothing to process
    Empty,
    /// VALIDATE passed and the registry accepted the artifacts
    Passed,
    /// Attempt failed with retries left
    Retry,
    /// Attempt failed and the retry budget is spent
    Exhausted,
}

impl StepOutcome {
    pub const ALL: [Self; 5] = [
        Self::Proceed,
        Self::Empty,
        Self::Passed,
        Self::Retry,
        Self::Exhausted,
    ];
}

/// Transition not in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal workflow transition from {from:?} on {outcome:?}")]
pub struct TransitionError {
    pub from: WorkflowState,
    pub outcome: StepOutcome,
}

/// Look up the next state
///
/// # Errors
/// `TransitionError` if `outcome` is not valid in `from`.
pub fn next_state(from: WorkflowState, outcome: StepOutcome) -> Result<WorkflowState, TransitionError> {
    use StepOutcome as O;
    use WorkflowState as S;

    let next = match (from, outcome) {
        (S::Reason, O::Proceed) => S::Plan,
        (S::Reason, O::Empty) => S::Idle,
        (S::Plan, O::Proceed) => S::Act,
        (S::Act, O::Proceed) => S::Validate,
        (S::Validate, O::Passed) => S::Success,
        (S::Plan | S::Act | S::Validate, O::Retry) => S::Plan,
        (S::Plan | S::Act | S::Validate, O::Exhausted) => S::Failure,
        _ => return Err(TransitionError { from, outcome }),
    };
    Ok(next)
}

/// Every state reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: WorkflowState) -> Vec<WorkflowState> {
    let mut out: Vec<WorkflowState> = StepOutcome::ALL
        .iter()
        .filter_map(|&outcome| next_state(from, outcome).ok())
        .collect();
    out.dedup();
    out
}

/// Whether `from → to` is a legal edge
///
/// # Errors
/// `TransitionError` naming the first outcome tried, if no outcome leads
/// from `from` to `to`.
pub fn validate_transition(from: WorkflowState, to: WorkflowState) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError {
            from,
            outcome: StepOutcome::Proceed,
        })
    }
}

/// Retry accounting after a failed attempt
///
/// `failed_attempts` already includes the attempt that just failed. With a
/// budget of `R`, the `R`-th failure exhausts the batch.
#[inline]
#[must_use]
pub fn after_failure(failed_attempts: u32, max_retry_attempts: u32) -> StepOutcome {
    if failed_attempts < max_retry_attempts {
        StepOutcome::Retry
    } else {
        StepOutcome::Exhausted
    }
}
