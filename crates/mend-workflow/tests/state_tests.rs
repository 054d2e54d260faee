use mend_workflow::state_machine::{
    after_failure, allowed_transitions, next_state, validate_transition,
};
use mend_workflow::{StepOutcome, WorkflowState};
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = WorkflowState> {
    prop_oneof![
        Just(WorkflowState::Reason),
        Just(WorkflowState::Plan),
        Just(WorkflowState::Act),
        Just(WorkflowState::Validate),
        Just(WorkflowState::Success),
        Just(WorkflowState::Failure),
        Just(WorkflowState::Idle),
    ]
}

fn any_outcome() -> impl Strategy<Value = StepOutcome> {
    prop_oneof![
        Just(StepOutcome::Proceed),
        Just(StepOutcome::Empty),
        Just(StepOutcome::Passed),
        Just(StepOutcome::Retry),
        Just(StepOutcome::Exhausted),
    ]
}

#[test]
fn test_reason_transitions() {
    assert!(validate_transition(WorkflowState::Reason, WorkflowState::Plan).is_ok());
    assert!(validate_transition(WorkflowState::Reason, WorkflowState::Idle).is_ok());

    // Invalid
    assert!(validate_transition(WorkflowState::Reason, WorkflowState::Validate).is_err());
    assert!(validate_transition(WorkflowState::Reason, WorkflowState::Failure).is_err());
}

#[test]
fn test_validate_transitions() {
    assert!(validate_transition(WorkflowState::Validate, WorkflowState::Success).is_ok());
    assert!(validate_transition(WorkflowState::Validate, WorkflowState::Plan).is_ok());
    assert!(validate_transition(WorkflowState::Validate, WorkflowState::Failure).is_ok());

    // Retries never re-enter REASON
    assert!(validate_transition(WorkflowState::Validate, WorkflowState::Reason).is_err());
}

#[test]
fn test_success_only_from_validate() {
    for from in WorkflowState::ALL {
        let reaches_success = allowed_transitions(from).contains(&WorkflowState::Success);
        assert_eq!(reaches_success, from == WorkflowState::Validate, "{from:?}");
    }
}

proptest! {
    #[test]
    fn prop_all_transitions_are_subset_of_allowed(from in any_state(), to in any_state()) {
        let res = validate_transition(from, to);
        let allowed = allowed_transitions(from);

        if res.is_ok() {
            assert!(allowed.contains(&to));
        } else {
            assert!(!allowed.contains(&to));
        }
    }

    #[test]
    fn prop_table_is_closed(from in any_state(), outcome in any_outcome()) {
        match next_state(from, outcome) {
            Ok(to) => {
                prop_assert!(!from.is_terminal());
                prop_assert!(allowed_transitions(from).contains(&to));
            }
            Err(e) => {
                prop_assert_eq!(e.from, from);
                prop_assert_eq!(e.outcome, outcome);
            }
        }
    }

    /// With budget R, failed attempts 1..R retry and attempt R exhausts
    #[test]
    fn prop_retry_budget_terminates(max in 1u32..20) {
        let mut state = WorkflowState::Plan;
        let mut failures = 0;
        while !state.is_terminal() {
            failures += 1;
            state = next_state(state, after_failure(failures, max)).unwrap();
        }
        prop_assert_eq!(state, WorkflowState::Failure);
        prop_assert_eq!(failures, max);
    }
}
