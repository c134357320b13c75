//! Assertions over run reports.

use crate::core::StageState;
use crate::pipeline::RunReport;

/// Asserts the final state of a stage.
pub fn assert_stage_state(report: &RunReport, stage: &str, expected: StageState) {
    let actual = report.stage_state(stage);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{stage}' to be {expected}, got {actual:?}"
    );
}

/// Asserts that each listed stage ended in `expected`.
pub fn assert_stages(report: &RunReport, stages: &[&str], expected: StageState) {
    for stage in stages {
        assert_stage_state(report, stage, expected);
    }
}

/// Asserts that an artifact was published.
pub fn assert_published(report: &RunReport, artifact: &str) {
    let outcome = report
        .artifact(artifact)
        .unwrap_or_else(|| panic!("Artifact '{artifact}' is not declared"));
    assert!(
        outcome.is_published(),
        "Expected artifact '{artifact}' to be published, note: {:?}",
        outcome.note
    );
}

/// Asserts that an artifact was not published.
pub fn assert_not_published(report: &RunReport, artifact: &str) {
    if let Some(outcome) = report.artifact(artifact) {
        assert!(
            !outcome.is_published(),
            "Expected artifact '{artifact}' not to be published"
        );
    }
}
