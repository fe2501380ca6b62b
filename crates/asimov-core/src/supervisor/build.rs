//! Build and submit passes

use std::collections::{HashMap, HashSet};

use asimov_artifact::write_atomic;
use asimov_kernel::state_machine::AnalysisStatus;
use parking_lot::Mutex;

use super::{bounded, PassError, PassReport, Supervisor};
use crate::error::{AsimovError, PipelineError};
use crate::ledger::Ledger;
use crate::model::{Production, ProductionId};
use crate::pipeline::{Pipeline, PipelineContext};
use crate::render::render_configuration;

impl Supervisor {
    /// Latest analyses per subject; a subject whose graph cannot be built
    /// contributes nothing
    fn latest(ledger: &Ledger) -> HashMap<String, HashSet<String>> {
        ledger
            .document()
            .subjects
            .keys()
            .map(|name| {
                let latest = match ledger.get_all_latest(name) {
                    Ok(latest) => latest.into_iter().collect(),
                    Err(e) => {
                        tracing::warn!(subject = %name, "Skipping subject: {}", e);
                        HashSet::new()
                    }
                };
                (name.clone(), latest)
            })
            .collect()
    }

    fn is_latest(latest: &HashMap<String, HashSet<String>>, id: &ProductionId) -> bool {
        match id {
            ProductionId::Analysis { subject, name } => {
                latest.get(subject).is_some_and(|s| s.contains(name))
            }
            _ => true,
        }
    }

    /// Productions a build or submit pass acts on
    fn eligible(&self, ledger: &Ledger, filter: Option<&str>) -> Vec<Production> {
        let latest = Self::latest(ledger);
        ledger
            .productions(&self.workspace)
            .into_iter()
            .filter(|p| p.status == AnalysisStatus::Ready)
            .filter(|p| filter.map_or(true, |subject| p.id.subject() == Some(subject)))
            .filter(|p| Self::is_latest(&latest, &p.id))
            .collect()
    }

    /// Promote `wait` productions whose inputs have finished
    fn promote(
        &self,
        ledger: &mut Ledger,
        dryrun: bool,
        report: &mut PassReport,
    ) -> Result<(), AsimovError> {
        let latest = Self::latest(ledger);
        let waiting: Vec<Production> = ledger
            .productions(&self.workspace)
            .into_iter()
            .filter(|p| p.status == AnalysisStatus::Wait)
            .filter(|p| match &p.id {
                ProductionId::Analysis { .. } => Self::is_latest(&latest, &p.id),
                _ => !p.inputs.is_empty() && p.inputs.iter().all(|i| i.status.is_finished()),
            })
            .collect();

        for mut production in waiting {
            if dryrun {
                report.plan(&production.id, "mark ready", None);
                continue;
            }
            let note = Some("inputs finished".to_string());
            match self.commit(ledger, &mut production, AnalysisStatus::Ready, note, report) {
                Ok(()) => {}
                Err(PassError::Fatal(e)) => return Err(e),
                Err(PassError::Production(e)) => {
                    self.fail(ledger, &mut production, &e, dryrun, report)?;
                }
            }
        }
        Ok(())
    }

    /// Render the configuration and build the job graph
    pub(super) async fn prepare(
        &self,
        production: &mut Production,
        plugin: &dyn Pipeline,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        if let Some(text) = render_configuration(production, plugin, &self.workspace)? {
            if ctx.dryrun {
                tracing::info!("Would write {}", production.config_file.display());
            } else {
                write_atomic(&production.config_file, text.as_bytes())
                    .map_err(|e| PipelineError::io(&production.config_file, e))?;
                tracing::debug!("Wrote {}", production.config_file.display());
            }
        }
        bounded(plugin.operation_timeout(), plugin.build_dag(production, ctx)).await
    }

    /// Hand a built production to the scheduler and mark it running
    pub(super) async fn submit_production(
        &self,
        ledger: &mut Ledger,
        production: &mut Production,
        plugin: &dyn Pipeline,
        ctx: &PipelineContext<'_>,
        report: &mut PassReport,
    ) -> Result<(), PassError> {
        let limit = plugin.operation_timeout();
        if let Err(e) = bounded(limit, plugin.before_submit(production, ctx)).await {
            tracing::warn!(production = %production.id, "before_submit failed: {}", e);
        }
        match bounded(limit, plugin.submit_dag(production, ctx)).await? {
            Some(id) => {
                production.set_job_id(id);
                let note = Some(format!("job {id}"));
                self.commit(ledger, production, AnalysisStatus::Running, note, report)
            }
            None if ctx.dryrun => {
                report.plan(&production.id, "submit", None);
                Ok(())
            }
            None => Err(PipelineError::SubmitFailed("no job id returned".to_string()).into()),
        }
    }

    /// Promote waiting productions, then render and build every ready one
    ///
    /// `filter` restricts the pass to one subject.
    ///
    /// # Errors
    /// Fatal errors only; plugin failures mark the production `stuck`
    pub async fn build(
        &self,
        filter: Option<&str>,
        dryrun: bool,
    ) -> Result<PassReport, AsimovError> {
        let mut ledger = self.ledger()?;
        let mut report = PassReport::default();
        self.promote(&mut ledger, dryrun, &mut report)?;

        let store = Mutex::new(self.workspace.open_store()?);
        let ctx = self.context(&store, dryrun);
        for mut production in self.eligible(&ledger, filter) {
            let plugin = match self.plugin_for(&mut production) {
                Ok(plugin) => plugin,
                Err(e) => {
                    self.fail(&mut ledger, &mut production, &e, dryrun, &mut report)?;
                    continue;
                }
            };
            match self.prepare(&mut production, plugin.as_ref(), &ctx).await {
                Ok(()) if dryrun => {
                    let detail = Some(production.config_file.display().to_string());
                    report.plan(&production.id, "build", detail);
                }
                Ok(()) => {
                    tracing::info!(production = %production.id, "Built");
                    ledger.record(&production)?;
                }
                Err(e) => self.fail(&mut ledger, &mut production, &e, dryrun, &mut report)?,
            }
        }
        Ok(report)
    }

    /// Submit every ready production
    ///
    /// # Errors
    /// Fatal errors only; plugin failures mark the production `stuck`
    pub async fn submit(
        &self,
        filter: Option<&str>,
        dryrun: bool,
    ) -> Result<PassReport, AsimovError> {
        let mut ledger = self.ledger()?;
        let mut report = PassReport::default();
        let store = Mutex::new(self.workspace.open_store()?);
        let ctx = self.context(&store, dryrun);
        for mut production in self.eligible(&ledger, filter) {
            let outcome = match self.plugin_for(&mut production) {
                Ok(plugin) => {
                    self.submit_production(
                        &mut ledger,
                        &mut production,
                        plugin.as_ref(),
                        &ctx,
                        &mut report,
                    )
                    .await
                }
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(()) => {}
                Err(PassError::Fatal(e)) => return Err(e),
                Err(PassError::Production(e)) => {
                    self.fail(&mut ledger, &mut production, &e, dryrun, &mut report)?;
                }
            }
        }
        Ok(report)
    }
}
