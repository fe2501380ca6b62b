//! Supervisor commands outside the happy path

use std::time::Duration;

use asimov_core::prelude::*;
use asimov_core::{DescriptionError, ReviewStatus};
use asimov_test_utils::{subject_document, TestProject};

fn a0() -> ProductionId {
    ProductionId::analysis("S0", "A0")
}

const RUNNING_A0: &str = "kind: event
name: S0
working directory: working/S0
inputs: {H1: strain}
productions:
  - A0:
      pipeline: X
      status: running
      scheduler:
        job id: 50
";

#[tokio::test]
async fn stop_ejects_the_job() {
    let project = TestProject::new();
    project.apply(RUNNING_A0);
    project.scheduler.set_status(50, JobStatus::Running);

    let from = project.supervisor.set_status(&a0(), AnalysisStatus::Stop).unwrap();
    assert_eq!(from, AnalysisStatus::Running);

    project.supervisor.monitor(false).await.unwrap();
    let production = project.production(&a0());
    assert_eq!(production.status, AnalysisStatus::Stopped);
    assert_eq!(production.job_id(), None);
    assert_eq!(project.scheduler.removed(), vec![ClusterId(50)]);
}

#[tokio::test]
async fn restart_rebuilds_and_resubmits() {
    let project = TestProject::new();
    project.apply(
        "kind: event
name: S0
working directory: working/S0
inputs: {H1: strain}
productions:
  - A0:
      pipeline: X
      status: stuck
      resurrections: 4
      scheduler:
        job id: 50
",
    );
    project.supervisor.set_status(&a0(), AnalysisStatus::Restart).unwrap();

    let report = project.supervisor.monitor(false).await.unwrap();
    assert_eq!(report.status_of(&a0()), Some(AnalysisStatus::Running));

    let production = project.production(&a0());
    assert_eq!(production.status, AnalysisStatus::Running);
    assert_eq!(production.job_id(), Some(ClusterId(42)));
    assert_eq!(production.resurrections(), 0);
    assert_eq!(project.scheduler.removed(), vec![ClusterId(50)]);
    assert_eq!(
        project.pipeline("X").calls(),
        vec!["build S0/A0".to_string(), "submit S0/A0".to_string()]
    );
}

#[tokio::test]
async fn dry_run_monitor_writes_nothing() {
    let project = TestProject::new();
    project.apply(RUNNING_A0);
    let before = std::fs::read_to_string(project.workspace().ledger_path()).unwrap();

    let report = project.supervisor.monitor(true).await.unwrap();
    assert_eq!(report.planned.len(), 1);
    assert_eq!(report.planned[0].action, "check completion");
    assert!(report.transitions.is_empty());

    let after = std::fs::read_to_string(project.workspace().ledger_path()).unwrap();
    assert_eq!(before, after);
    assert!(project.pipeline("X").calls().is_empty());
}

#[tokio::test]
async fn dry_run_build_and_submit() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "X", &[])]));

    let report = project.supervisor.chain(true).await.unwrap();
    let actions: Vec<&str> = report.planned.iter().map(|p| p.action.as_str()).collect();
    assert_eq!(actions, vec!["build", "submit"]);
    assert!(!project.workspace().root().join("checkouts/S0/A0.ini").exists());
    assert!(project.scheduler.submissions().is_empty());
    assert_eq!(project.status(&a0()), AnalysisStatus::Ready);
}

#[tokio::test]
async fn unreachable_scheduler_aborts_the_pass() {
    let project = TestProject::new();
    project.apply(RUNNING_A0);
    let before = std::fs::read_to_string(project.workspace().ledger_path()).unwrap();
    project.scheduler.set_unavailable(true);

    let err = project.supervisor.monitor(false).await.unwrap_err();
    assert!(matches!(err, AsimovError::Scheduler(_)));
    assert!(err.is_fatal_for_pass());
    let after = std::fs::read_to_string(project.workspace().ledger_path()).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn build_failure_is_contained() {
    let project = TestProject::with_pipelines(&["X", "Y"]);
    project.apply(&subject_document("S0", &[("A0", "X", &[]), ("A1", "Y", &[])]));
    project.pipeline("X").fail_build(true);

    let report = project.supervisor.build(None, false).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].production, a0());
    assert_eq!(project.status(&a0()), AnalysisStatus::Stuck);

    let a1 = ProductionId::analysis("S0", "A1");
    assert_eq!(project.status(&a1), AnalysisStatus::Ready);
    assert_eq!(project.pipeline("Y").calls(), vec!["build S0/A1".to_string()]);
}

#[tokio::test]
async fn unknown_pipeline_marks_stuck() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "lalinference", &[])]));

    let report = project.supervisor.build(None, false).await.unwrap();
    assert!(report.failures[0].message.contains("lalinference"));
    assert_eq!(project.status(&a0()), AnalysisStatus::Stuck);
}

#[tokio::test]
async fn chain_reaches_running() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "X", &[])]));

    let report = project.supervisor.chain(false).await.unwrap();
    assert!(report.failures.is_empty(), "{report}");
    assert_eq!(project.status(&a0()), AnalysisStatus::Running);
}

#[tokio::test]
async fn subject_filter_limits_build() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "X", &[])]));
    project.apply(&subject_document("S1", &[("A0", "X", &[])]));

    project.supervisor.build(Some("S1"), false).await.unwrap();
    assert_eq!(project.pipeline("X").calls(), vec!["build S1/A0".to_string()]);
}

#[tokio::test]
async fn cron_monitor_start_and_stop() {
    let project = TestProject::new();
    let program = std::path::Path::new("/usr/bin/asimov");

    let id = project.supervisor.start(program).await.unwrap();
    assert_eq!(id, ClusterId(42));
    let (_, description) = &project.scheduler.submissions()[0];
    assert_eq!(description.arguments, vec!["monitor".to_string(), "--chain".to_string()]);
    assert_eq!(description.universe, "local");
    assert_eq!(description.cron_minute.as_deref(), Some("*/15"));
    assert_eq!(project.supervisor.ledger().unwrap().document().cronjob, Some(id));

    assert!(matches!(
        project.supervisor.start(program).await,
        Err(AsimovError::CronAlreadyRunning(ClusterId(42)))
    ));

    assert_eq!(project.supervisor.stop().await.unwrap(), Some(id));
    assert_eq!(project.supervisor.ledger().unwrap().document().cronjob, None);
    assert_eq!(project.supervisor.stop().await.unwrap(), None);
}

#[test]
fn set_status_rejects_automatic_states() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "X", &[])]));

    let err = project.supervisor.set_status(&a0(), AnalysisStatus::Uploaded).unwrap_err();
    assert!(matches!(err, AsimovError::Description(DescriptionError::InvalidField { .. })));

    let err = project
        .supervisor
        .set_status(&ProductionId::analysis("S0", "A9"), AnalysisStatus::Stop)
        .unwrap_err();
    assert!(matches!(err, AsimovError::UnknownProduction(_)));
}

#[test]
fn create_production_and_review() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "X", &[])]));

    let analysis = Analysis::new("A1", "X").with_needs(vec!["A0".parse().unwrap()]);
    project.supervisor.create_production("S0", analysis, false).unwrap();
    assert_eq!(project.status(&ProductionId::analysis("S0", "A1")), AnalysisStatus::Wait);

    let err = project
        .supervisor
        .create_production("S0", Analysis::new("A0", "X"), false)
        .unwrap_err();
    assert!(matches!(
        err,
        AsimovError::Description(DescriptionError::DuplicateAnalysis { .. })
    ));
    assert!(matches!(
        project.supervisor.create_production("S9", Analysis::new("A0", "X"), false),
        Err(AsimovError::Description(DescriptionError::UnknownSubject(_)))
    ));

    project
        .supervisor
        .add_review(&a0(), Some(ReviewStatus::Approved), "looks good")
        .unwrap();
    assert_eq!(project.production(&a0()).review, Some(ReviewStatus::Approved));
}

#[test]
fn status_report_lists_every_production() {
    let project = TestProject::new();
    project.apply(RUNNING_A0);
    let lines = project.supervisor.status_report().unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].job_id, Some(ClusterId(50)));
    assert!(lines[0].to_string().contains("S0/A0"));
}

#[test]
fn subject_without_required_fields_is_rejected() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "X", &[])]));
    let before = std::fs::read_to_string(project.workspace().ledger_path()).unwrap();

    let err = project
        .supervisor
        .apply_text("kind: event\nname: S9\n", None)
        .unwrap_err();
    assert!(matches!(
        err,
        AsimovError::Description(DescriptionError::MissingField { ref field, .. })
            if field == "working directory"
    ));
    assert!(err.is_user_error());

    let err = project
        .supervisor
        .apply_text("kind: event\nname: S9\nworking directory: working/S9\n", None)
        .unwrap_err();
    assert!(matches!(
        err,
        AsimovError::Description(DescriptionError::MissingField { ref field, .. })
            if field == "inputs"
    ));

    let after = std::fs::read_to_string(project.workspace().ledger_path()).unwrap();
    assert_eq!(before, after);
    assert!(project.supervisor.ledger().unwrap().get_subject("S9").is_none());
}

#[tokio::test]
async fn slow_build_times_out_and_sticks() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "X", &[])]));
    let pipeline = project.pipeline("X");
    pipeline.set_operation_timeout(Duration::from_millis(20));
    pipeline.delay("build", Duration::from_secs(5));

    let report = project.supervisor.build(None, false).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].message.contains("timed out"));
    assert_eq!(project.status(&a0()), AnalysisStatus::Stuck);

    let log = std::fs::read_to_string(project.workspace().log_path(&a0())).unwrap();
    assert!(log.contains("-> stuck: pipeline operation timed out"));
}

#[tokio::test]
async fn slow_completion_check_counts_as_incomplete() {
    let project = TestProject::new();
    project.apply(RUNNING_A0);
    let pipeline = project.pipeline("X");
    pipeline.set_complete(true);
    pipeline.set_operation_timeout(Duration::from_millis(20));
    pipeline.delay("detect_completion", Duration::from_secs(5));

    let report = project.supervisor.monitor(false).await.unwrap();
    assert!(report.failures.is_empty(), "{report}");
    let production = project.production(&a0());
    assert_eq!(production.status, AnalysisStatus::Running);
    assert_eq!(production.resurrections(), 1);
    assert_eq!(production.job_id(), Some(ClusterId(42)));
}

#[tokio::test]
async fn slow_post_processing_start_sticks() {
    let project = TestProject::new();
    project.apply(RUNNING_A0);
    let pipeline = project.pipeline("X");
    pipeline.set_complete(true);
    pipeline.set_operation_timeout(Duration::from_millis(20));
    pipeline.delay("after_completion", Duration::from_secs(5));

    let report = project.supervisor.monitor(false).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].message.contains("timed out"));
    assert_eq!(project.status(&a0()), AnalysisStatus::Stuck);
    assert!(project.scheduler.submissions().is_empty());
}
