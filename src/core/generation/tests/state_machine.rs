use crate::core::generation::types::{GenerationStatus, can_transition};

#[test]
fn running_reaches_every_other_state() {
    use GenerationStatus::*;
    for to in [AwaitingApproval, AwaitingAuth, Done, Error, Cancelled] {
        assert!(
            can_transition(Running, to),
            "expected running -> {} to be allowed",
            to.as_str()
        );
    }
}

#[test]
fn suspension_states_resume_or_terminate() {
    use GenerationStatus::*;
    for from in [AwaitingApproval, AwaitingAuth] {
        assert!(can_transition(from, Running));
        assert!(can_transition(from, Error));
        assert!(can_transition(from, Cancelled));
        assert!(!can_transition(from, Done));
    }
}

#[test]
fn suspension_states_do_not_swap_directly() {
    use GenerationStatus::*;
    assert!(!can_transition(AwaitingApproval, AwaitingAuth));
    assert!(!can_transition(AwaitingAuth, AwaitingApproval));
}

#[test]
fn terminal_states_are_immutable() {
    use GenerationStatus::*;
    for from in [Done, Error, Cancelled] {
        for to in [Running, AwaitingApproval, AwaitingAuth, Done, Error, Cancelled] {
            if from == to {
                continue;
            }
            assert!(
                !can_transition(from, to),
                "terminal {} must not move to {}",
                from.as_str(),
                to.as_str()
            );
        }
    }
}

#[test]
fn self_transitions_are_allowed() {
    use GenerationStatus::*;
    for state in [Running, AwaitingApproval, AwaitingAuth, Done, Error, Cancelled] {
        assert!(can_transition(state, state));
    }
}

#[test]
fn terminal_predicate_matches_the_transition_table() {
    use GenerationStatus::*;
    assert!(Done.is_terminal());
    assert!(Error.is_terminal());
    assert!(Cancelled.is_terminal());
    assert!(!Running.is_terminal());
    assert!(!AwaitingApproval.is_terminal());
    assert!(!AwaitingAuth.is_terminal());
}

#[test]
fn status_serializes_snake_case() {
    assert_eq!(GenerationStatus::AwaitingApproval.as_str(), "awaiting_approval");
    assert_eq!(
        serde_json::to_value(GenerationStatus::AwaitingAuth).unwrap(),
        serde_json::json!("awaiting_auth")
    );
}
