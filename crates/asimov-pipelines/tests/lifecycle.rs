//! The bundled plugins driven by the supervisor against the in-memory scheduler

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use asimov_core::prelude::*;
use asimov_pipelines::builtin_registry;
use asimov_test_utils::{isolated_loader, MemoryScheduler};
use pretty_assertions::assert_eq;

const TERMINATED: &str = "\
005 (001.000.000) 2024-05-01 12:00:00 Job terminated.
\t(1) Normal termination (return value {code})
...
";

struct Project {
    _dir: tempfile::TempDir,
    scheduler: Arc<MemoryScheduler>,
    supervisor: Supervisor,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace =
            Workspace::init_with(&dir.path().join("project"), "test", isolated_loader()).unwrap();
        let scheduler = Arc::new(MemoryScheduler::starting_at(1));
        let supervisor = Supervisor::new(
            workspace,
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            builtin_registry(),
        );
        Self {
            _dir: dir,
            scheduler,
            supervisor,
        }
    }

    fn rundir(&self) -> PathBuf {
        self.supervisor.workspace().rundir(&a0())
    }

    fn production(&self) -> Production {
        self.supervisor
            .ledger()
            .unwrap()
            .productions(self.supervisor.workspace())
            .into_iter()
            .find(|p| p.id == a0())
            .unwrap()
    }

    fn terminate(&self, log: &str, code: i32) {
        let text = TERMINATED.replace("{code}", &code.to_string());
        fs::write(self.rundir().join(log), text).unwrap();
    }
}

fn a0() -> ProductionId {
    ProductionId::analysis("S0", "A0")
}

const COMMAND_SUBJECT: &str = "\
kind: event
name: S0
working directory: working/S0
inputs: {H1: strain}
productions:
  - A0:
      pipeline: command
      executable: /usr/bin/run
      arguments: [--ini, \"{config}\"]
      assets:
        posterior: posterior.dat
";

#[tokio::test]
async fn command_pipeline_runs_to_upload() {
    let project = Project::new();
    let templates = project.supervisor.workspace().root().join("templates");
    fs::create_dir_all(&templates).unwrap();
    fs::write(templates.join("command.ini"), "[{{ analysis.name }}]\n").unwrap();
    project.supervisor.apply_text(COMMAND_SUBJECT, None).unwrap();

    let report = project.supervisor.chain(false).await.unwrap();
    assert!(report.failures.is_empty(), "{report}");
    let production = project.production();
    assert_eq!(production.status, AnalysisStatus::Running);
    assert_eq!(production.job_id(), Some(ClusterId(1)));

    let config = project.supervisor.workspace().checkout_path(&a0(), "ini");
    let (_, submitted) = project.scheduler.submissions().remove(0);
    assert_eq!(submitted.executable, "/usr/bin/run");
    assert_eq!(submitted.arguments, vec!["--ini".to_string(), config.display().to_string()]);
    assert_eq!(fs::read_to_string(&config).unwrap(), "[A0]\n");

    // job left the queue with exit 0 and its asset in place
    project.terminate("A0.log", 0);
    fs::write(project.rundir().join("posterior.dat"), b"samples").unwrap();
    project.scheduler.finish(1);
    project.supervisor.monitor(false).await.unwrap();
    assert_eq!(project.production().status, AnalysisStatus::Processing);

    let report = project.supervisor.monitor(false).await.unwrap();
    assert_eq!(report.status_of(&a0()), Some(AnalysisStatus::Uploaded));
    let results = project.supervisor.results(&a0()).unwrap();
    assert_eq!(results.keys().collect::<Vec<_>>(), vec!["posterior"]);
}

#[tokio::test]
async fn command_failure_is_resurrected() {
    let project = Project::new();
    project.supervisor.apply_text(COMMAND_SUBJECT, None).unwrap();
    project.supervisor.chain(false).await.unwrap();

    project.terminate("A0.log", 1);
    project.scheduler.finish(1);
    project.supervisor.monitor(false).await.unwrap();

    let production = project.production();
    assert_eq!(production.status, AnalysisStatus::Running);
    assert_eq!(production.job_id(), Some(ClusterId(2)));
    assert_eq!(production.resurrections(), 1);
}

#[tokio::test]
async fn command_post_processing_job() {
    let project = Project::new();
    let subject = format!(
        "{COMMAND_SUBJECT}      postprocessing:\n        executable: /usr/bin/summarise\n\
         \x20       arguments: \"{{rundir}}\"\n"
    );
    project.supervisor.apply_text(&subject, None).unwrap();
    project.supervisor.chain(false).await.unwrap();

    project.terminate("A0.log", 0);
    fs::write(project.rundir().join("posterior.dat"), b"samples").unwrap();
    project.scheduler.finish(1);
    project.supervisor.monitor(false).await.unwrap();

    let production = project.production();
    assert_eq!(production.status, AnalysisStatus::Processing);
    assert_eq!(production.job_id(), Some(ClusterId(2)));
    assert_eq!(production.postprocessing_status().as_deref(), Some("running"));
    let (_, post) = project.scheduler.submissions().remove(1);
    assert_eq!(post.arguments, vec![project.rundir().display().to_string()]);

    // post job still queued: nothing to archive yet
    project.supervisor.monitor(false).await.unwrap();
    assert_eq!(project.production().status, AnalysisStatus::Processing);

    project.terminate("A0_post.log", 0);
    project.scheduler.finish(2);
    project.supervisor.monitor(false).await.unwrap();
    let production = project.production();
    assert_eq!(production.status, AnalysisStatus::Uploaded);
    assert_eq!(production.postprocessing_status().as_deref(), Some("finished"));
}

const DAG_SUBJECT: &str = "\
kind: event
name: S0
working directory: working/S0
inputs: {H1: strain}
productions:
  - A0:
      pipeline: dagman
      stages:
        - {name: generate, executable: /usr/bin/generate}
        - {name: infer, executable: /usr/bin/infer, parents: [generate]}
";

#[tokio::test]
async fn dagman_pipeline_builds_and_completes() {
    let project = Project::new();
    project.supervisor.apply_text(DAG_SUBJECT, None).unwrap();
    let report = project.supervisor.chain(false).await.unwrap();
    assert!(report.failures.is_empty(), "{report}");

    let rundir = project.rundir();
    let dag = fs::read_to_string(rundir.join("A0.dag")).unwrap();
    assert!(dag.contains("PARENT generate CHILD infer\n"));
    assert!(rundir.join("A0_generate.sub").is_file());
    assert!(rundir.join("A0_infer.sub").is_file());

    let (_, submitted) = project.scheduler.submissions().remove(0);
    assert_eq!(submitted.universe, "scheduler");
    assert!(submitted.arguments.contains(&"A0.dag".to_string()));

    fs::write(
        rundir.join("A0.dag.dagman.out"),
        "05/01/24 12:00:00 **** condor_scheduniv_exec.1.0 (condor_DAGMAN) pid 7 \
         EXITING WITH STATUS 0\n",
    )
    .unwrap();
    project.scheduler.finish(1);
    project.supervisor.monitor(false).await.unwrap();
    assert_eq!(project.production().status, AnalysisStatus::Processing);
}

#[tokio::test]
async fn dagman_without_stages_is_stuck() {
    let project = Project::new();
    project
        .supervisor
        .apply_text(
            "kind: event\nname: S0\nworking directory: working/S0\ninputs: {H1: strain}\n\
             productions:\n  - A0:\n      pipeline: dagman\n",
            None,
        )
        .unwrap();
    let report = project.supervisor.build(None, false).await.unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(project.production().status, AnalysisStatus::Stuck);
}
