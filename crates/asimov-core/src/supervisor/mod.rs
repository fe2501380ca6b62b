//! The workflow supervisor
//!
//! Reconciles the ledger with the batch scheduler, one pass at a time:
//! - `build` promotes waiting productions and renders their job graphs
//! - `submit` hands built productions to the scheduler
//! - `monitor` classifies every active production against the live job
//!   table and drives it through the state machine
//! - `chain` runs the three passes back to back
//!
//! # Core Concepts
//!
//! - **Pass**: reads the ledger from disk, acts, and writes each mutation
//!   back before visiting the next production. Passes share no state.
//! - **Failure boundary**: a plugin error marks its production `stuck`,
//!   is appended to that production's log and never stops the pass.
//!   Scheduler and persistence errors abort the pass.
//! - **Dry run**: every pass can run without writing anything; the report
//!   then lists what would have happened.

mod build;
mod monitor;
mod report;

pub use report::{Failure, MonitorReport, PassReport, PlannedAction, StatusLine, Transition};

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use asimov_artifact::{ResourceRecord, ResultsStore};
use asimov_kernel::scheduler::{ClusterId, JobDescription, Scheduler};
use asimov_kernel::state_machine::{validate_transition, AnalysisStatus};
use asimov_kernel::StateMachineError;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::apply::{ApplyDocument, ApplyOutcome};
use crate::error::{AsimovError, DescriptionError, PipelineError};
use crate::hooks::HookRegistry;
use crate::ledger::Ledger;
use crate::model::{Analysis, ProductionId, Production, ReviewMessage, ReviewStatus};
use crate::pipeline::{Pipeline, PipelineContext, PipelineRegistry};
use crate::workspace::Workspace;

/// Error inside one production's step of a pass
#[derive(Debug)]
enum PassError {
    /// Aborts the pass
    Fatal(AsimovError),
    /// Marks the production stuck
    Production(PipelineError),
}

impl From<PipelineError> for PassError {
    fn from(e: PipelineError) -> Self {
        Self::Production(e)
    }
}

impl From<StateMachineError> for PassError {
    fn from(e: StateMachineError) -> Self {
        Self::Production(PipelineError::State(e))
    }
}

impl From<AsimovError> for PassError {
    fn from(e: AsimovError) -> Self {
        match e {
            AsimovError::Pipeline(e) => Self::Production(e),
            AsimovError::State(e) => Self::Production(PipelineError::State(e)),
            other => Self::Fatal(other),
        }
    }
}

/// Run a plugin operation under its deadline
async fn bounded<T, F>(limit: Duration, operation: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| PipelineError::Timeout {
            seconds: limit.as_secs(),
        })?
}

/// Ledger, scheduler and plugins bound to one project
pub struct Supervisor {
    workspace: Workspace,
    scheduler: Arc<dyn Scheduler>,
    pipelines: PipelineRegistry,
    hooks: HookRegistry,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("root", &self.workspace.root())
            .field("pipelines", &self.pipelines)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Supervisor with the built-in post-monitor hooks
    pub fn new(
        workspace: Workspace,
        scheduler: Arc<dyn Scheduler>,
        pipelines: PipelineRegistry,
    ) -> Self {
        Self {
            workspace,
            scheduler,
            pipelines,
            hooks: HookRegistry::with_builtin(),
        }
    }

    /// Replace the post-monitor hooks
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// Project layout and configuration
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Scheduler used by every pass
    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// Plugins available to productions
    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    /// The ledger as currently on disk
    ///
    /// # Errors
    /// [`AsimovError::Ledger`] if it cannot be read
    pub fn ledger(&self) -> Result<Ledger, AsimovError> {
        Ok(Ledger::load(&self.workspace.ledger_path())?)
    }

    fn context<'a>(&'a self, store: &'a Mutex<ResultsStore>, dryrun: bool) -> PipelineContext<'a> {
        PipelineContext {
            workspace: &self.workspace,
            scheduler: self.scheduler.as_ref(),
            store,
            dryrun,
        }
    }

    /// Plugin for a production; also fixes its configuration path
    fn plugin_for(&self, production: &mut Production) -> Result<Arc<dyn Pipeline>, PipelineError> {
        let plugin = self.pipelines.create(&production.pipeline)?;
        production.config_file = self
            .workspace
            .checkout_path(&production.id, plugin.config_extension());
        Ok(plugin)
    }

    /// Validated transition, persisted immediately
    fn commit(
        &self,
        ledger: &mut Ledger,
        production: &mut Production,
        to: AnalysisStatus,
        note: Option<String>,
        report: &mut PassReport,
    ) -> Result<(), PassError> {
        let from = production.status;
        if from == to {
            return self.persist(ledger, production);
        }
        production.transition(to)?;
        self.persist(ledger, production)?;
        tracing::info!(
            production = %production.id,
            status = %to,
            "{} -> {}",
            from,
            to
        );
        report.transitions.push(Transition {
            production: production.id.clone(),
            from,
            to,
            note,
        });
        Ok(())
    }

    /// Write status and bookkeeping back to the ledger
    fn persist(&self, ledger: &mut Ledger, production: &Production) -> Result<(), PassError> {
        ledger.record(production).map_err(PassError::Fatal)
    }

    /// Mark a production stuck and log why
    ///
    /// A dry run only reports the failure.
    fn fail(
        &self,
        ledger: &mut Ledger,
        production: &mut Production,
        error: &PipelineError,
        dryrun: bool,
        report: &mut PassReport,
    ) -> Result<(), AsimovError> {
        let from = production.status;
        tracing::warn!(production = %production.id, status = %from, "{}", error);
        if dryrun {
            report.failures.push(Failure {
                production: production.id.clone(),
                message: error.to_string(),
            });
            return Ok(());
        }
        let line = format!("{from} -> stuck: {error}");
        if let Err(e) = self.workspace.append_log(&production.id, &line) {
            tracing::warn!("Could not write log for {}: {}", production.id, e);
        }
        production.force_status(AnalysisStatus::Stuck);
        ledger.record(production)?;
        if from != AnalysisStatus::Stuck {
            report.transitions.push(Transition {
                production: production.id.clone(),
                from,
                to: AnalysisStatus::Stuck,
                note: Some(error.to_string()),
            });
        }
        report.failures.push(Failure {
            production: production.id.clone(),
            message: error.to_string(),
        });
        Ok(())
    }

    /// Apply parsed description documents in one ledger write
    ///
    /// # Errors
    /// [`AsimovError::Description`] leaves the ledger untouched
    pub fn apply(
        &self,
        documents: Vec<ApplyDocument>,
        subject: Option<&str>,
    ) -> Result<Vec<ApplyOutcome>, AsimovError> {
        let mut ledger = self.ledger()?;
        let outcomes = ledger.update(|doc| {
            let mut outcomes = Vec::new();
            for document in documents {
                outcomes.extend(doc.apply(document, subject)?);
            }
            Ok(outcomes)
        })?;
        for outcome in &outcomes {
            tracing::info!("{}", outcome);
        }
        Ok(outcomes)
    }

    /// Parse and apply a YAML document stream
    ///
    /// # Errors
    /// As [`Supervisor::apply`]
    pub fn apply_text(
        &self,
        text: &str,
        subject: Option<&str>,
    ) -> Result<Vec<ApplyOutcome>, AsimovError> {
        let documents = ApplyDocument::parse_all(text)?;
        self.apply(documents, subject)
    }

    /// Add one analysis to an existing subject
    ///
    /// # Errors
    /// [`DescriptionError::UnknownSubject`] or
    /// [`DescriptionError::DuplicateAnalysis`]
    pub fn create_production(
        &self,
        subject: &str,
        analysis: Analysis,
        explicit_status: bool,
    ) -> Result<ApplyOutcome, AsimovError> {
        let mut ledger = self.ledger()?;
        let stored = ledger
            .document()
            .subject(subject)
            .ok_or_else(|| DescriptionError::UnknownSubject(subject.to_string()))?;
        if stored.analysis(&analysis.name).is_some() {
            return Err(DescriptionError::DuplicateAnalysis {
                subject: subject.to_string(),
                analysis: analysis.name,
            }
            .into());
        }
        let document = ApplyDocument::Analysis {
            subject: Some(subject.to_string()),
            analysis,
            explicit_status,
        };
        let mut outcomes = ledger.update(|doc| Ok(doc.apply(document, None)?))?;
        outcomes
            .pop()
            .ok_or_else(|| AsimovError::UnknownProduction(subject.to_string()))
    }

    /// User-requested status change, checked against the transition table
    ///
    /// # Errors
    /// [`AsimovError::Description`] for a status users may not request,
    /// [`AsimovError::State`] for an illegal transition,
    /// [`AsimovError::UnknownProduction`]
    pub fn set_status(
        &self,
        id: &ProductionId,
        status: AnalysisStatus,
    ) -> Result<AnalysisStatus, AsimovError> {
        if !status.is_user_requestable() {
            return Err(DescriptionError::invalid(
                id.to_string(),
                "status",
                format!("cannot be set to {status}; use ready, stop, restart, cancelled or manual"),
            )
            .into());
        }
        let mut ledger = self.ledger()?;
        let from = ledger.update(|doc| {
            let (current, _) = doc
                .node_mut(id)
                .ok_or_else(|| AsimovError::UnknownProduction(id.to_string()))?;
            let from = *current;
            validate_transition(from, status)?;
            *current = status;
            Ok(from)
        })?;
        tracing::info!(production = %id, status = %status, "{} -> {} (requested)", from, status);
        if let Err(e) = self
            .workspace
            .append_log(id, &format!("{from} -> {status}: requested"))
        {
            tracing::warn!("Could not write log for {}: {}", id, e);
        }
        Ok(from)
    }

    /// Append a review message to an analysis or project analysis
    ///
    /// # Errors
    /// [`AsimovError::UnknownProduction`] for anything else
    pub fn add_review(
        &self,
        id: &ProductionId,
        status: Option<ReviewStatus>,
        message: &str,
    ) -> Result<(), AsimovError> {
        let mut ledger = self.ledger()?;
        ledger.update(|doc| {
            let review = match id {
                ProductionId::Analysis { subject, name } => doc
                    .subjects
                    .get_mut(subject)
                    .and_then(|s| s.analyses.get_mut(name))
                    .map(|a| &mut a.review),
                ProductionId::Project { name } => {
                    doc.project_analyses.get_mut(name).map(|a| &mut a.review)
                }
                ProductionId::PostProcess { .. } => None,
            }
            .ok_or_else(|| AsimovError::UnknownProduction(id.to_string()))?;
            review.add(ReviewMessage::new(message, status));
            Ok(())
        })?;
        tracing::info!(production = %id, "Review added");
        Ok(())
    }

    /// Stored resources of a production
    ///
    /// # Errors
    /// [`AsimovError::UnknownProduction`], or a store failure
    pub fn results(
        &self,
        id: &ProductionId,
    ) -> Result<IndexMap<String, ResourceRecord>, AsimovError> {
        let ledger = self.ledger()?;
        let production = ledger
            .productions(&self.workspace)
            .into_iter()
            .find(|p| &p.id == id)
            .ok_or_else(|| AsimovError::UnknownProduction(id.to_string()))?;
        let (subject, analysis) = production.store_location();
        let store = self.workspace.open_store()?;
        Ok(store.list_resources(&subject, &analysis))
    }

    /// One line per production, in ledger order
    ///
    /// # Errors
    /// If the ledger cannot be read
    pub fn status_report(&self) -> Result<Vec<StatusLine>, AsimovError> {
        let ledger = self.ledger()?;
        Ok(ledger
            .productions(&self.workspace)
            .into_iter()
            .map(|p| StatusLine {
                job_id: p.job_id(),
                production: p.id,
                pipeline: p.pipeline,
                status: p.status,
            })
            .collect())
    }

    /// Submit the periodic `monitor --chain` job
    ///
    /// `program` is the asimov executable the scheduler should run.
    ///
    /// # Errors
    /// [`AsimovError::CronAlreadyRunning`] when one is recorded, or a
    /// scheduler failure
    pub async fn start(&self, program: &Path) -> Result<ClusterId, AsimovError> {
        let mut ledger = self.ledger()?;
        if let Some(id) = ledger.document().cronjob {
            return Err(AsimovError::CronAlreadyRunning(id));
        }
        let config = self.workspace.config();
        let logs = self.workspace.log_root();
        let mut description = JobDescription::new(program.display().to_string())
            .arguments(["monitor", "--chain"])
            .universe("local")
            .working_directory(self.workspace.root())
            .logs(
                logs.join("asimov_cron.log"),
                logs.join("asimov_cron.out"),
                logs.join("asimov_cron.err"),
            )
            .batch_name(format!("asimov/monitor/{}", self.workspace.project_name()))
            .accounting(&config.pipelines.accounting, &config.condor.user)
            .submit_file(self.workspace.state_dir().join("cron.sub"));
        description.cron_minute = Some(config.condor.cron_minute.clone());
        description.getenv = true;

        let id = self.scheduler.submit(&description).await?;
        ledger.set_cronjob(Some(id))?;
        tracing::info!(job_id = %id, "Monitor cron job submitted");
        Ok(id)
    }

    /// Remove the periodic monitor job; `None` if there was none
    ///
    /// # Errors
    /// Scheduler or persistence failures
    pub async fn stop(&self) -> Result<Option<ClusterId>, AsimovError> {
        let mut ledger = self.ledger()?;
        let Some(id) = ledger.document().cronjob else {
            tracing::info!("No monitor cron job recorded");
            return Ok(None);
        };
        self.scheduler.remove(id).await?;
        ledger.set_cronjob(None)?;
        tracing::info!(job_id = %id, "Monitor cron job removed");
        Ok(Some(id))
    }
}
