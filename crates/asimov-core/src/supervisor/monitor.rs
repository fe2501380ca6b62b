//! Monitor and chain passes

use std::future::Future;
use std::time::Duration;

use asimov_kernel::scheduler::{JobStatus, JobTable};
use asimov_kernel::state_machine::AnalysisStatus;
use asimov_merge::{Mapping, Value};
use parking_lot::Mutex;

use super::{bounded, MonitorReport, PassError, PassReport, Supervisor};
use crate::error::AsimovError;
use crate::ledger::Ledger;
use crate::model::Production;
use crate::pipeline::{Pipeline, PipelineContext};

/// What the live job table says about a production's recorded job
#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    Queued,
    Running,
    Held(Option<String>),
    Completed,
    Absent,
}

fn job_state(production: &Production, jobs: &JobTable) -> JobState {
    let Some(job) = production.job_id().and_then(|id| jobs.get(id)) else {
        return JobState::Absent;
    };
    match job.status {
        JobStatus::Idle | JobStatus::Unexplained => JobState::Queued,
        JobStatus::Running => JobState::Running,
        JobStatus::Held => JobState::Held(job.hold_reason.clone()),
        JobStatus::Completed => JobState::Completed,
        JobStatus::Removed | JobStatus::SubmissionError => JobState::Absent,
    }
}

/// A completion check that overruns its deadline counts as "not yet"
async fn timed_check<F: Future<Output = bool>>(limit: Duration, check: F) -> bool {
    if let Ok(done) = tokio::time::timeout(limit, check).await {
        done
    } else {
        tracing::warn!("Completion check timed out after {}s", limit.as_secs());
        false
    }
}

/// Everything one production's step needs
struct Step<'s, 'c> {
    ledger: &'s mut Ledger,
    plugin: &'s dyn Pipeline,
    ctx: &'s PipelineContext<'c>,
    jobs: &'s mut JobTable,
    report: &'s mut PassReport,
}

impl Supervisor {
    /// One reconciliation pass over every active production
    ///
    /// # Errors
    /// Scheduler, ledger and persistence errors abort the pass; plugin
    /// errors mark their production `stuck` and are listed in the report
    pub async fn monitor(&self, dryrun: bool) -> Result<MonitorReport, AsimovError> {
        let mut ledger = self.ledger()?;
        let mut jobs = self.scheduler.list_jobs().await?;
        let mut report = PassReport::default();
        let store = Mutex::new(self.workspace.open_store()?);
        let ctx = self.context(&store, dryrun);

        let active: Vec<Production> = ledger
            .productions(&self.workspace)
            .into_iter()
            .filter(|p| p.status.is_active() && p.status != AnalysisStatus::Ready)
            .collect();
        tracing::info!("Monitoring {} productions against {} jobs", active.len(), jobs.len());

        for mut production in active {
            if dryrun {
                self.plan(&production, &jobs, &mut report);
                continue;
            }
            let plugin = match self.plugin_for(&mut production) {
                Ok(plugin) => plugin,
                Err(e) => {
                    self.fail(&mut ledger, &mut production, &e, dryrun, &mut report)?;
                    continue;
                }
            };
            let mut step = Step {
                ledger: &mut ledger,
                plugin: plugin.as_ref(),
                ctx: &ctx,
                jobs: &mut jobs,
                report: &mut report,
            };
            match self.advance(&mut production, &mut step).await {
                Ok(()) => {}
                Err(PassError::Fatal(e)) => return Err(e),
                Err(PassError::Production(e)) => {
                    self.fail(&mut ledger, &mut production, &e, dryrun, &mut report)?;
                }
            }
        }

        if !dryrun {
            self.hooks.run_postmonitor(&ledger, &self.workspace);
        }
        Ok(report)
    }

    /// Build, submit and monitor in sequence
    ///
    /// # Errors
    /// The first fatal error of any pass
    pub async fn chain(&self, dryrun: bool) -> Result<PassReport, AsimovError> {
        let mut report = self.build(None, dryrun).await?;
        report.extend(self.submit(None, dryrun).await?);
        report.extend(self.monitor(dryrun).await?);
        Ok(report)
    }

    fn plan(&self, production: &Production, jobs: &JobTable, report: &mut PassReport) {
        let id = &production.id;
        match production.status {
            AnalysisStatus::Stop => report.plan(id, "eject and mark stopped", None),
            AnalysisStatus::Restart => report.plan(id, "clean, rebuild and resubmit", None),
            status => match job_state(production, jobs) {
                JobState::Queued => report.plan(id, "leave queued", None),
                JobState::Running => report.plan(id, "mark running", None),
                JobState::Held(reason) => report.plan(id, "mark stuck", reason),
                JobState::Completed | JobState::Absent => {
                    let action = match status {
                        AnalysisStatus::Finished => "start post-processing",
                        AnalysisStatus::Processing => "check post-processing",
                        _ => "check completion",
                    };
                    report.plan(id, action, None);
                }
            },
        }
    }

    async fn advance(
        &self,
        production: &mut Production,
        step: &mut Step<'_, '_>,
    ) -> Result<(), PassError> {
        let limit = step.plugin.operation_timeout();
        match production.status {
            AnalysisStatus::Stop => {
                bounded(limit, step.plugin.eject_job(production, step.ctx)).await?;
                self.commit(step.ledger, production, AnalysisStatus::Stopped, None, step.report)
            }
            AnalysisStatus::Restart => self.restart(production, step).await,
            AnalysisStatus::Running
            | AnalysisStatus::Stuck
            | AnalysisStatus::Finished
            | AnalysisStatus::Processing => match job_state(production, step.jobs) {
                JobState::Queued => {
                    tracing::debug!(production = %production.id, "Job queued");
                    Ok(())
                }
                JobState::Running => {
                    if production.status == AnalysisStatus::Stuck {
                        let note = Some("job running".to_string());
                        let running = AnalysisStatus::Running;
                        self.commit(step.ledger, production, running, note, step.report)?;
                    }
                    let before = production.meta.clone();
                    bounded(limit, step.plugin.while_running(production, step.ctx)).await?;
                    if production.meta != before {
                        self.persist(step.ledger, production)?;
                    }
                    Ok(())
                }
                JobState::Held(reason) => {
                    let note = Some(reason.unwrap_or_else(|| "job held".to_string()));
                    self.commit(step.ledger, production, AnalysisStatus::Stuck, note, step.report)
                }
                JobState::Completed => {
                    self.job_gone(production, step).await?;
                    *step.jobs = self
                        .scheduler
                        .refresh_jobs()
                        .await
                        .map_err(|e| PassError::Fatal(e.into()))?;
                    Ok(())
                }
                JobState::Absent => self.job_gone(production, step).await,
            },
            _ => Ok(()),
        }
    }

    /// The recorded job has left the queue
    async fn job_gone(
        &self,
        production: &mut Production,
        step: &mut Step<'_, '_>,
    ) -> Result<(), PassError> {
        let limit = step.plugin.operation_timeout();
        match production.status {
            AnalysisStatus::Running | AnalysisStatus::Stuck => {
                if timed_check(limit, step.plugin.detect_completion(production, step.ctx)).await {
                    self.collect_profiling(production).await;
                    let note = Some("job complete".to_string());
                    let finished = AnalysisStatus::Finished;
                    self.commit(step.ledger, production, finished, note, step.report)?;
                    return self.complete(production, step).await;
                }
                if production.status == AnalysisStatus::Stuck {
                    tracing::debug!(
                        production = %production.id,
                        "Stuck with no job and no results"
                    );
                    return Ok(());
                }
                bounded(limit, step.plugin.resurrect(production, step.ctx)).await?;
                self.persist(step.ledger, production)
            }
            AnalysisStatus::Finished => self.complete(production, step).await,
            AnalysisStatus::Processing => {
                let processed = step.plugin.detect_completion_processing(production, step.ctx);
                if timed_check(limit, processed).await {
                    bounded(limit, step.plugin.after_processing(production, step.ctx)).await?;
                    let note = Some("results archived".to_string());
                    let uploaded = AnalysisStatus::Uploaded;
                    return self.commit(step.ledger, production, uploaded, note, step.report);
                }
                bounded(limit, step.plugin.resurrect(production, step.ctx)).await?;
                self.persist(step.ledger, production)
            }
            _ => Ok(()),
        }
    }

    /// Start post-processing of a finished production
    async fn complete(
        &self,
        production: &mut Production,
        step: &mut Step<'_, '_>,
    ) -> Result<(), PassError> {
        let limit = step.plugin.operation_timeout();
        bounded(limit, step.plugin.after_completion(production, step.ctx)).await?;
        let note = production.job_id().map(|id| format!("job {id}"));
        self.commit(step.ledger, production, AnalysisStatus::Processing, note, step.report)
    }

    /// `restart`: clean, rebuild and resubmit with a fresh resurrection budget
    async fn restart(
        &self,
        production: &mut Production,
        step: &mut Step<'_, '_>,
    ) -> Result<(), PassError> {
        let limit = step.plugin.operation_timeout();
        // 1. Drop whatever is still queued
        if production.job_id().is_some() {
            bounded(limit, step.plugin.eject_job(production, step.ctx)).await?;
        }
        // 2. Start from an empty run directory
        bounded(limit, step.plugin.clean(production, step.ctx)).await?;
        production.set_resurrections(0);
        // 3. Rebuild and resubmit
        self.prepare(production, step.plugin, step.ctx).await?;
        self.submit_production(step.ledger, production, step.plugin, step.ctx, step.report)
            .await
    }

    /// Scheduler accounting for the primary job, kept under `profiling`
    async fn collect_profiling(&self, production: &mut Production) {
        let Some(id) = production.job_id() else {
            return;
        };
        match self.scheduler.accounting(id).await {
            Ok(accounting) if accounting.is_empty() => {}
            Ok(accounting) => match serde_yaml::to_value(&accounting) {
                Ok(Value::Mapping(profiling)) => production.set_profiling(profiling),
                Ok(_) => production.set_profiling(Mapping::new()),
                Err(e) => tracing::warn!(production = %production.id, "Unusable accounting: {}", e),
            },
            Err(e) => {
                tracing::warn!(production = %production.id, job_id = %id, "No accounting: {}", e);
            }
        }
    }
}
