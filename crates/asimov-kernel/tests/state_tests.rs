use asimov_kernel::state_machine::{allowed_transitions, validate_transition, AnalysisStatus};
use proptest::prelude::*;

fn any_status() -> impl Strategy<Value = AnalysisStatus> {
    proptest::sample::select(AnalysisStatus::ALL.to_vec())
}

#[test]
fn test_happy_path() {
    use AnalysisStatus::*;
    let path = [Wait, Ready, Running, Finished, Processing, Uploaded];
    for pair in path.windows(2) {
        assert!(validate_transition(pair[0], pair[1]).is_ok(), "{} -> {}", pair[0], pair[1]);
    }
}

#[test]
fn test_restart_path() {
    use AnalysisStatus::*;
    assert!(validate_transition(Running, Restart).is_ok());
    assert!(validate_transition(Restart, Running).is_ok());
    assert!(validate_transition(Stop, Stopped).is_ok());
}

#[test]
fn test_cannot_skip_to_uploaded() {
    assert!(validate_transition(AnalysisStatus::Running, AnalysisStatus::Uploaded).is_err());
    assert!(validate_transition(AnalysisStatus::Wait, AnalysisStatus::Running).is_err());
}

proptest! {
    #[test]
    fn prop_validation_agrees_with_table(from in any_status(), to in any_status()) {
        let res = validate_transition(from, to);
        let allowed = allowed_transitions(from);

        if from == to || allowed.contains(&to) {
            prop_assert!(res.is_ok());
        } else {
            prop_assert!(res.is_err());
        }
    }

    #[test]
    fn prop_display_parses_back(status in any_status()) {
        prop_assert_eq!(status.to_string().parse::<AnalysisStatus>(), Ok(status));
    }
}
