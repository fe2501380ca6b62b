//! End-to-end supervisor scenarios against the in-memory scheduler

use asimov_core::prelude::*;
use asimov_core::{AnalysisView, Owner};
use asimov_merge::Value;
use asimov_test_utils::{subject_document, TestProject};
use pretty_assertions::assert_eq;

fn a0() -> ProductionId {
    ProductionId::analysis("S0", "A0")
}

#[tokio::test]
async fn single_analysis_happy_path() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "X", &[])]));
    assert_eq!(project.status(&a0()), AnalysisStatus::Ready);

    // build renders the configuration
    let report = project.supervisor.build(None, false).await.unwrap();
    assert!(report.failures.is_empty(), "{report}");
    let config = project.workspace().root().join("checkouts/S0/A0.ini");
    let text = std::fs::read_to_string(&config).unwrap();
    assert!(text.starts_with("[S0/A0]\npipeline = X\n"));

    // submit hands it to the scheduler
    project.supervisor.submit(None, false).await.unwrap();
    let production = project.production(&a0());
    assert_eq!(production.status, AnalysisStatus::Running);
    assert_eq!(production.job_id(), Some(ClusterId(42)));

    // job running: nothing changes
    project.scheduler.set_status(42, JobStatus::Running);
    let report = project.supervisor.monitor(false).await.unwrap();
    assert!(report.transitions.is_empty());
    assert_eq!(project.status(&a0()), AnalysisStatus::Running);

    // job gone and results complete: finished, then post-processing starts
    project.scheduler.finish(42);
    project.pipeline("X").set_complete(true);
    let report = project.supervisor.monitor(false).await.unwrap();
    let steps: Vec<_> = report.transitions.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        steps,
        vec![
            (AnalysisStatus::Running, AnalysisStatus::Finished),
            (AnalysisStatus::Finished, AnalysisStatus::Processing),
        ]
    );
    let production = project.production(&a0());
    assert_eq!(production.status, AnalysisStatus::Processing);
    assert_eq!(production.job_id(), Some(ClusterId(43)));
    assert_eq!(production.postprocessing_status().as_deref(), Some("running"));

    // post-processing job gone: results archived
    project.scheduler.finish(43);
    let report = project.supervisor.monitor(false).await.unwrap();
    assert_eq!(report.status_of(&a0()), Some(AnalysisStatus::Uploaded));
    let production = project.production(&a0());
    assert_eq!(production.status, AnalysisStatus::Uploaded);
    assert_eq!(production.postprocessing_status().as_deref(), Some("finished"));

    let results = project.supervisor.results(&a0()).unwrap();
    assert!(results.contains_key("result.dat"));
}

#[tokio::test]
async fn dependency_blocking() {
    let project = TestProject::new();
    project.apply(&subject_document("S0", &[("A0", "X", &[]), ("A1", "X", &["A0"])]));

    let ledger = project.supervisor.ledger().unwrap();
    assert_eq!(ledger.get_all_latest("S0").unwrap(), vec!["A0".to_string()]);
    assert_eq!(project.status(&ProductionId::analysis("S0", "A1")), AnalysisStatus::Wait);

    let mut ledger = project.supervisor.ledger().unwrap();
    ledger
        .update(|doc| {
            let subject = doc.subject_mut("S0").unwrap();
            subject.analysis_mut("A0").unwrap().status = AnalysisStatus::Finished;
            Ok(())
        })
        .unwrap();
    assert_eq!(ledger.get_all_latest("S0").unwrap(), vec!["A1".to_string()]);

    // the next build promotes and builds A1 only
    let a1 = ProductionId::analysis("S0", "A1");
    let report = project.supervisor.build(None, false).await.unwrap();
    assert_eq!(report.status_of(&a1), Some(AnalysisStatus::Ready));
    assert_eq!(project.pipeline("X").calls(), vec!["build S0/A1".to_string()]);
}

#[tokio::test]
async fn held_job_marks_stuck() {
    let project = TestProject::new();
    project.apply(
        "kind: event
name: S0
working directory: working/S0
inputs: {H1: strain}
productions:
  - A0:
      pipeline: X
      status: running
      scheduler:
        job id: 50
",
    );
    project.scheduler.hold(50, "disk quota exceeded");

    let report = project.supervisor.monitor(false).await.unwrap();
    assert_eq!(report.transitions.len(), 1);
    assert_eq!(report.transitions[0].note.as_deref(), Some("disk quota exceeded"));

    let production = project.production(&a0());
    assert_eq!(production.status, AnalysisStatus::Stuck);
    assert_eq!(production.job_id(), Some(ClusterId(50)));
}

#[tokio::test]
async fn resurrection_cap_marks_stuck() {
    let project = TestProject::new();
    project.apply(
        "kind: event
name: S0
working directory: working/S0
inputs: {H1: strain}
productions:
  - A0:
      pipeline: X
      status: running
      resurrections: 5
      scheduler:
        job id: 50
",
    );

    let report = project.supervisor.monitor(false).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].message.contains("resurrection budget exhausted"));
    assert_eq!(project.status(&a0()), AnalysisStatus::Stuck);
    assert!(project.scheduler.submissions().is_empty());

    let log = std::fs::read_to_string(project.workspace().log_path(&a0())).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("running -> stuck: resurrection budget exhausted"));
}

#[tokio::test]
async fn resurrection_below_cap_resubmits() {
    let project = TestProject::new();
    project.apply(
        "kind: event
name: S0
working directory: working/S0
inputs: {H1: strain}
productions:
  - A0:
      pipeline: X
      status: running
      resurrections: 2
      scheduler:
        job id: 50
",
    );

    let report = project.supervisor.monitor(false).await.unwrap();
    assert!(report.failures.is_empty());
    let production = project.production(&a0());
    assert_eq!(production.status, AnalysisStatus::Running);
    assert_eq!(production.resurrections(), 3);
    assert_eq!(production.job_id(), Some(ClusterId(42)));
}

#[tokio::test]
async fn diff_aware_save() {
    let project = TestProject::new();
    project.apply(
        "kind: configuration
priors:
  q: [0, 1]
---
kind: event
name: S0
working directory: working/S0
inputs: {H1: strain}
productions:
  - A0:
      pipeline: X
      priors:
        q: [0, 1]
",
    );

    let text = std::fs::read_to_string(project.workspace().ledger_path()).unwrap();
    let stored: Value = serde_yaml::from_str(&text).unwrap();
    let node = &stored["events"][0]["productions"]["A0"];
    assert_eq!(node["pipeline"], Value::from("X"));
    assert!(node.get("priors").map_or(true, |p| p.get("q").is_none()));

    let ledger = project.supervisor.ledger().unwrap();
    let views: Vec<AnalysisView> = ledger.get_analyses(Some("S0"), &[]).unwrap();
    let q = asimov_merge::get_path_mapping(&views[0].resolved, "priors.q").unwrap();
    assert_eq!(q, &serde_yaml::from_str::<Value>("[0, 1]").unwrap());
}

#[tokio::test]
async fn project_analysis_selects_by_pipeline() {
    let project = TestProject::new();
    for subject in ["S0", "S1"] {
        project.apply(&subject_document(
            subject,
            &[("A0", "bayeswave", &[]), ("A1", "bilby", &[])],
        ));
    }
    project.apply(
        "kind: projectanalysis
name: PA
pipeline: X
subjects: [S0, S1]
analyses:
  - pipeline:bayeswave
",
    );

    let ledger = project.supervisor.ledger().unwrap();
    let pa = ledger.document().project_analysis("PA").unwrap();
    let inputs: Vec<(String, String)> = ledger
        .document()
        .project_inputs(pa)
        .into_iter()
        .map(|v| (v.subject, v.analysis.name))
        .collect();
    assert_eq!(
        inputs,
        vec![
            ("S0".to_string(), "A0".to_string()),
            ("S1".to_string(), "A0".to_string()),
        ]
    );

    let production = project.production(&ProductionId::Project { name: "PA".into() });
    assert_eq!(production.inputs.len(), 2);
    assert!(production.inputs.iter().all(|i| i.pipeline == "bayeswave"));
}

#[tokio::test]
async fn subject_postprocessing_runs_after_inputs_finish() {
    let project = TestProject::new();
    project.apply(
        "kind: configuration
postprocessing:
  summary:
    pipeline: X
    analyses:
      - pipeline:X
---
kind: event
name: S0
working directory: working/S0
inputs: {H1: strain}
productions:
  - A0:
      pipeline: X
      status: uploaded
",
    );
    let id = ProductionId::PostProcess {
        owner: Owner::Subject("S0".into()),
        name: "summary".into(),
    };
    assert_eq!(project.status(&id), AnalysisStatus::Wait);

    project.supervisor.build(None, false).await.unwrap();
    assert_eq!(project.status(&id), AnalysisStatus::Ready);
    assert!(project
        .workspace()
        .root()
        .join("checkouts/S0/postprocessing/summary.ini")
        .is_file());

    project.supervisor.submit(None, false).await.unwrap();
    let production = project.production(&id);
    assert_eq!(production.status, AnalysisStatus::Running);
    assert_eq!(production.job_id(), Some(ClusterId(42)));

    let ledger = project.supervisor.ledger().unwrap();
    let state = &ledger.document().subject("S0").unwrap().postprocesses["summary"];
    assert_eq!(state.status, AnalysisStatus::Running);
}
