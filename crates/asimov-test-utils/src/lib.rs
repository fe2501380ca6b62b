//! Testing utilities for the asimov workspace
//!
//! Shared test doubles and fixtures:
//! - [`MemoryScheduler`]: a scriptable job table that records submissions
//! - [`ScriptedPipeline`]: a plugin whose completion checks and failures
//!   are switched from the test
//! - [`TestProject`]: an initialised project in a temporary directory

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use asimov_config::{ConfigLoader, EnvSource};
use asimov_core::{
    Pipeline, PipelineContext, PipelineError, PipelineRegistry, Production, ProductionId,
    Supervisor, Workspace,
};
use asimov_kernel::scheduler::{
    Accounting, ClusterId, JobDescription, JobInfo, JobStatus, JobTable, Scheduler,
};
use asimov_kernel::SchedulerError;
use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct SchedulerState {
    next_id: u64,
    jobs: JobTable,
    submissions: Vec<(ClusterId, JobDescription)>,
    removed: Vec<ClusterId>,
    accounting: HashMap<ClusterId, Accounting>,
    unavailable: bool,
    listings: u32,
}

/// In-memory scheduler with sequential cluster ids
///
/// Submitted jobs start `idle`; tests move them with [`MemoryScheduler::set_status`]
/// and [`MemoryScheduler::finish`].
#[derive(Debug)]
pub struct MemoryScheduler {
    state: Mutex<SchedulerState>,
}

impl Default for MemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryScheduler {
    /// Scheduler numbering jobs from 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// First submission gets cluster id `first`
    pub fn starting_at(first: u64) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                next_id: first,
                ..SchedulerState::default()
            }),
        }
    }

    /// Put a job in the table, or change its status
    pub fn set_status(&self, id: u64, status: JobStatus) {
        let mut state = self.state.lock();
        let id = ClusterId(id);
        match state.jobs.get_mut(id) {
            Some(job) => job.status = status,
            None => state.jobs.insert(JobInfo::new(id, status)),
        }
    }

    /// Hold a job with a reason
    pub fn hold(&self, id: u64, reason: &str) {
        let mut state = self.state.lock();
        let id = ClusterId(id);
        let job = state
            .jobs
            .remove(id)
            .unwrap_or_else(|| JobInfo::new(id, JobStatus::Held));
        let mut job = job.with_hold_reason(reason);
        job.status = JobStatus::Held;
        state.jobs.insert(job);
    }

    /// Drop a job from the table, as if it left the queue
    pub fn finish(&self, id: u64) {
        self.state.lock().jobs.remove(ClusterId(id));
    }

    /// Accounting returned for job `id`
    pub fn set_accounting(&self, id: u64, accounting: Accounting) {
        self.state.lock().accounting.insert(ClusterId(id), accounting);
    }

    /// Make `list_jobs` fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Every submission, oldest first
    pub fn submissions(&self) -> Vec<(ClusterId, JobDescription)> {
        self.state.lock().submissions.clone()
    }

    /// Jobs passed to `remove`
    pub fn removed(&self) -> Vec<ClusterId> {
        self.state.lock().removed.clone()
    }

    /// True if job `id` is in the table
    pub fn contains(&self, id: u64) -> bool {
        self.state.lock().jobs.contains(ClusterId(id))
    }

    /// Number of `list_jobs` and `refresh_jobs` calls
    pub fn listings(&self) -> u32 {
        self.state.lock().listings
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn submit(&self, description: &JobDescription) -> Result<ClusterId, SchedulerError> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(SchedulerError::Unavailable("memory scheduler switched off".into()));
        }
        let id = ClusterId(state.next_id);
        state.next_id += 1;
        let mut job = JobInfo::new(id, JobStatus::Idle);
        job.command = description.executable.clone();
        job.batch_name.clone_from(&description.batch_name);
        state.jobs.insert(job);
        state.submissions.push((id, description.clone()));
        Ok(id)
    }

    async fn list_jobs(&self) -> Result<JobTable, SchedulerError> {
        let mut state = self.state.lock();
        state.listings += 1;
        if state.unavailable {
            return Err(SchedulerError::Unavailable("memory scheduler switched off".into()));
        }
        Ok(state.jobs.clone())
    }

    async fn remove(&self, id: ClusterId) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        state.jobs.remove(id);
        state.removed.push(id);
        Ok(())
    }

    async fn accounting(&self, id: ClusterId) -> Result<Accounting, SchedulerError> {
        Ok(self.state.lock().accounting.get(&id).cloned().unwrap_or_default())
    }
}

/// Template the scripted pipeline renders when the project has none
pub const SCRIPTED_TEMPLATE: &str = "[{{ analysis.subject }}/{{ analysis.name }}]\n\
    pipeline = {{ analysis.pipeline }}\n\
    {% for input in analysis.inputs %}input = {{ input.name }}\n{% endfor %}";

/// Plugin double whose behaviour is switched by the test
///
/// - `build_dag` writes `dag.sub` into the run directory
/// - `submit_dag` submits one job to the context's scheduler
/// - `after_completion` submits a post-processing job when enabled
/// - `collect_assets` writes and reports `result.dat`
/// - [`ScriptedPipeline::delay`] makes an operation sleep before it acts
#[derive(Debug)]
pub struct ScriptedPipeline {
    name: String,
    complete: AtomicBool,
    processing_complete: AtomicBool,
    post_job: AtomicBool,
    fail_build: AtomicBool,
    fail_submit: AtomicBool,
    fail_post: AtomicBool,
    cap: AtomicU32,
    timeout: Mutex<Option<Duration>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedPipeline {
    /// Plugin reporting nothing complete and post-processing done
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            complete: AtomicBool::new(false),
            processing_complete: AtomicBool::new(true),
            post_job: AtomicBool::new(true),
            fail_build: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
            fail_post: AtomicBool::new(false),
            cap: AtomicU32::new(asimov_core::pipeline::DEFAULT_RESURRECTION_CAP),
            timeout: Mutex::new(None),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Result of `detect_completion`
    pub fn set_complete(&self, done: bool) {
        self.complete.store(done, Ordering::SeqCst);
    }

    /// Result of `detect_completion_processing`
    pub fn set_processing_complete(&self, done: bool) {
        self.processing_complete.store(done, Ordering::SeqCst);
    }

    /// Whether `after_completion` submits a job
    pub fn set_post_job(&self, enabled: bool) {
        self.post_job.store(enabled, Ordering::SeqCst);
    }

    /// Make `build_dag` fail
    pub fn fail_build(&self, fail: bool) {
        self.fail_build.store(fail, Ordering::SeqCst);
    }

    /// Make `submit_dag` fail
    pub fn fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    /// Make `after_completion` fail
    pub fn fail_post(&self, fail: bool) {
        self.fail_post.store(fail, Ordering::SeqCst);
    }

    /// Override the resurrection cap
    pub fn set_resurrection_cap(&self, cap: u32) {
        self.cap.store(cap, Ordering::SeqCst);
    }

    /// Deadline the supervisor gives each operation
    pub fn set_operation_timeout(&self, limit: Duration) {
        *self.timeout.lock() = Some(limit);
    }

    /// Sleep for `duration` at the start of `operation`
    ///
    /// Honoured by `build`, `detect_completion` and `after_completion`.
    pub fn delay(&self, operation: &str, duration: Duration) {
        self.delays.lock().insert(operation.to_string(), duration);
    }

    async fn pause(&self, operation: &str) {
        let delay = self.delays.lock().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// `operation production` entries, oldest first
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, operation: &str, production: &Production) {
        self.calls.lock().push(format!("{operation} {}", production.id));
    }

    async fn submit_job(
        &self,
        production: &Production,
        ctx: &PipelineContext<'_>,
        stage: &str,
    ) -> Result<ClusterId, PipelineError> {
        let description = JobDescription::new("/bin/true")
            .arguments([stage.to_string(), production.id.to_string()])
            .working_directory(&production.rundir)
            .batch_name(format!("{}/{stage}", production.id));
        Ok(ctx.scheduler.submit(&description).await?)
    }
}

#[async_trait]
impl Pipeline for ScriptedPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn resurrection_cap(&self) -> u32 {
        self.cap.load(Ordering::SeqCst)
    }

    fn default_template(&self) -> Option<&str> {
        Some(SCRIPTED_TEMPLATE)
    }

    fn operation_timeout(&self) -> Duration {
        self.timeout
            .lock()
            .unwrap_or(asimov_core::pipeline::DEFAULT_OPERATION_TIMEOUT)
    }

    async fn build_dag(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        self.record("build", production);
        self.pause("build").await;
        if self.fail_build.load(Ordering::SeqCst) {
            return Err(PipelineError::BuildFailed("scripted build failure".into()));
        }
        if ctx.dryrun {
            return Ok(());
        }
        fs::create_dir_all(&production.rundir)
            .map_err(|e| PipelineError::io(&production.rundir, e))?;
        let dag = production.rundir.join("dag.sub");
        fs::write(&dag, production.config_file.display().to_string())
            .map_err(|e| PipelineError::io(&dag, e))
    }

    async fn submit_dag(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<Option<ClusterId>, PipelineError> {
        self.record("submit", production);
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(PipelineError::SubmitFailed("scripted submit failure".into()));
        }
        if ctx.dryrun {
            return Ok(None);
        }
        self.submit_job(production, ctx, "primary").await.map(Some)
    }

    async fn detect_completion(&self, production: &Production, _ctx: &PipelineContext<'_>) -> bool {
        self.record("detect_completion", production);
        self.pause("detect_completion").await;
        self.complete.load(Ordering::SeqCst)
    }

    async fn detect_completion_processing(
        &self,
        production: &Production,
        _ctx: &PipelineContext<'_>,
    ) -> bool {
        self.record("detect_completion_processing", production);
        self.processing_complete.load(Ordering::SeqCst)
    }

    async fn after_completion(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        self.record("after_completion", production);
        self.pause("after_completion").await;
        if self.fail_post.load(Ordering::SeqCst) {
            return Err(PipelineError::PostprocessFailed("scripted post-processing failure".into()));
        }
        if self.post_job.load(Ordering::SeqCst) {
            let id = self.submit_job(production, ctx, "postprocess").await?;
            production.set_job_id(id);
        }
        production.set_postprocessing_status("running");
        Ok(())
    }

    fn collect_assets(&self, production: &Production) -> BTreeMap<String, PathBuf> {
        let path = production.rundir.join("result.dat");
        if fs::create_dir_all(&production.rundir).is_err()
            || fs::write(&path, production.id.to_string()).is_err()
        {
            return BTreeMap::new();
        }
        BTreeMap::from([("result.dat".to_string(), path)])
    }
}

/// Configuration loader that ignores the host's files and environment
pub fn isolated_loader() -> ConfigLoader {
    ConfigLoader::new("asimov")
        .with_paths(Vec::new())
        .with_env(EnvSource::Disabled)
}

/// An initialised project in a temporary directory
///
/// One [`ScriptedPipeline`] is registered for every tag passed to
/// [`TestProject::with_pipelines`]; the memory scheduler numbers jobs from 42.
pub struct TestProject {
    pub dir: tempfile::TempDir,
    pub scheduler: Arc<MemoryScheduler>,
    pub pipelines: BTreeMap<String, Arc<ScriptedPipeline>>,
    pub supervisor: Supervisor,
}

impl std::fmt::Debug for TestProject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestProject")
            .field("root", &self.dir.path())
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl TestProject {
    /// Project with a single scripted pipeline tagged `X`
    ///
    /// # Panics
    /// If the temporary project cannot be created
    pub fn new() -> Self {
        Self::with_pipelines(&["X"])
    }

    /// # Panics
    /// If the temporary project cannot be created
    pub fn with_pipelines(tags: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("temporary directory");
        let workspace = Workspace::init_with(&dir.path().join("project"), "test", isolated_loader())
            .expect("initialise project");
        let scheduler = Arc::new(MemoryScheduler::starting_at(42));
        let mut registry = PipelineRegistry::new();
        let mut pipelines = BTreeMap::new();
        for tag in tags {
            let pipeline = Arc::new(ScriptedPipeline::new(tag));
            registry.register_instance(tag, Arc::clone(&pipeline) as Arc<dyn Pipeline>);
            pipelines.insert((*tag).to_string(), pipeline);
        }
        let supervisor =
            Supervisor::new(workspace, Arc::clone(&scheduler) as Arc<dyn Scheduler>, registry);
        Self {
            dir,
            scheduler,
            pipelines,
            supervisor,
        }
    }

    /// The scripted pipeline registered under `tag`
    ///
    /// # Panics
    /// If no such pipeline was registered
    pub fn pipeline(&self, tag: &str) -> &ScriptedPipeline {
        self.pipelines.get(tag).expect("registered pipeline")
    }

    /// Workspace of the supervisor
    pub fn workspace(&self) -> &Workspace {
        self.supervisor.workspace()
    }

    /// Apply YAML description documents
    ///
    /// # Panics
    /// If the documents are rejected
    pub fn apply(&self, text: &str) {
        self.supervisor.apply_text(text, None).expect("apply documents");
    }

    /// Current status of a production
    ///
    /// # Panics
    /// If the ledger cannot be read or the production does not exist
    pub fn status(&self, id: &ProductionId) -> asimov_kernel::state_machine::AnalysisStatus {
        self.production(id).status
    }

    /// A production as materialised from the ledger on disk
    ///
    /// # Panics
    /// If the ledger cannot be read or the production does not exist
    pub fn production(&self, id: &ProductionId) -> Production {
        self.supervisor
            .ledger()
            .expect("load ledger")
            .productions(self.workspace())
            .into_iter()
            .find(|p| &p.id == id)
            .expect("production exists")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// A subject document with analyses given as `(name, pipeline, needs)`
pub fn subject_document(subject: &str, analyses: &[(&str, &str, &[&str])]) -> String {
    let mut text = format!(
        "kind: event\nname: {subject}\nworking directory: working/{subject}\n\
         inputs: {{H1: strain}}\nproductions:\n"
    );
    for (name, pipeline, needs) in analyses {
        text.push_str(&format!("  - {name}:\n      pipeline: {pipeline}\n"));
        if !needs.is_empty() {
            text.push_str(&format!("      needs: [{}]\n", needs.join(", ")));
        }
    }
    text
}
