//! Single-job pipeline
//!
//! Runs one executable per production and, optionally, one post-processing
//! job after it. Everything comes from the production's resolved metadata,
//! so `pipelines.command` in the ledger supplies project-wide defaults:
//!
//! ```yaml
//! executable: /usr/bin/run_analysis
//! arguments: [--ini, "{config}", --outdir, "{rundir}/output"]
//! assets:
//!   posterior: output/posterior.h5
//! samples: [output/posterior.h5]
//! postprocessing:
//!   executable: /usr/bin/summarise
//!   arguments: "{rundir}/output"
//! scheduler:
//!   request memory: 4 GB
//! ```
//!
//! # Completion
//!
//! A job is complete when the last termination event in its HTCondor user
//! log reports exit status 0 and every declared asset exists.

use std::collections::BTreeMap;
use std::path::PathBuf;

use asimov_core::{Pipeline, PipelineContext, PipelineError, Production};
use asimov_kernel::scheduler::{submit_file_text, ClusterId, JobDescription};
use asimov_merge::get_path_mapping;
use async_trait::async_trait;

use crate::common::{
    assets_present, existing_assets, job_description, sample_files, stem, string_list,
    terminated_normally, write_file,
};

/// Registry tag
pub const TAG: &str = "command";

/// One scheduler job per production
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandPipeline;

impl CommandPipeline {
    /// The plugin; all settings come from production metadata
    pub fn new() -> Self {
        Self
    }

    fn primary(
        production: &Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<JobDescription, String> {
        let executable = production
            .meta_str("executable")
            .ok_or_else(|| format!("{} has no executable", production.id))?;
        let arguments = string_list(get_path_mapping(&production.meta, "arguments"));
        Ok(job_description(production, ctx, &stem(production), &executable, &arguments))
    }

    /// The post-processing job, if one is configured
    fn post(production: &Production, ctx: &PipelineContext<'_>) -> Option<JobDescription> {
        let executable = production.meta_str("postprocessing.executable")?;
        let arguments = string_list(get_path_mapping(&production.meta, "postprocessing.arguments"));
        let stem = format!("{}_post", stem(production));
        Some(job_description(production, ctx, &stem, &executable, &arguments))
    }

    fn post_log(production: &Production) -> PathBuf {
        production.rundir.join(format!("{}_post.log", stem(production)))
    }
}

#[async_trait]
impl Pipeline for CommandPipeline {
    fn name(&self) -> &str {
        TAG
    }

    async fn build_dag(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        let description = Self::primary(production, ctx).map_err(PipelineError::BuildFailed)?;
        let path = production.rundir.join(format!("{}.sub", stem(production)));
        if ctx.dryrun {
            tracing::info!("Would write {}", path.display());
            return Ok(());
        }
        write_file(&path, &submit_file_text(&description)).await?;
        tracing::info!(production = %production.id, "Wrote {}", path.display());
        Ok(())
    }

    async fn submit_dag(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<Option<ClusterId>, PipelineError> {
        let description = Self::primary(production, ctx).map_err(PipelineError::SubmitFailed)?;
        if ctx.dryrun {
            tracing::info!("Would submit {}", description.executable);
            return Ok(None);
        }
        if !production.rundir.is_dir() {
            return Err(PipelineError::SubmitFailed(format!(
                "{} has not been built",
                production.id
            )));
        }
        let id = ctx.scheduler.submit(&description).await?;
        tracing::info!(
            production = %production.id,
            job_id = %id,
            "Submitted {}",
            description.executable
        );
        Ok(Some(id))
    }

    async fn detect_completion(&self, production: &Production, _ctx: &PipelineContext<'_>) -> bool {
        let log = production.rundir.join(format!("{}.log", stem(production)));
        terminated_normally(&log) && assets_present(production)
    }

    async fn detect_completion_processing(
        &self,
        production: &Production,
        ctx: &PipelineContext<'_>,
    ) -> bool {
        if Self::post(production, ctx).is_none() {
            return true;
        }
        terminated_normally(&Self::post_log(production))
    }

    async fn after_completion(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        let Some(description) = Self::post(production, ctx) else {
            return Ok(());
        };
        if ctx.dryrun {
            tracing::info!("Would submit post-processing {}", description.executable);
            return Ok(());
        }
        let id = ctx
            .scheduler
            .submit(&description)
            .await
            .map_err(|e| PipelineError::PostprocessFailed(e.to_string()))?;
        tracing::info!(production = %production.id, job_id = %id, "Started post-processing");
        production.set_job_id(id);
        production.set_postprocessing_status("running");
        Ok(())
    }

    fn collect_assets(&self, production: &Production) -> BTreeMap<String, PathBuf> {
        existing_assets(production)
    }

    fn samples(&self, production: &Production) -> Vec<PathBuf> {
        sample_files(production)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asimov_config::ProcessConfig;
    use asimov_core::{ProductionId, Workspace};
    use asimov_merge::{set_path_mapping, Value};
    use asimov_test_utils::MemoryScheduler;
    use parking_lot::Mutex;

    fn production(root: &std::path::Path) -> Production {
        let mut production = Production::new(
            ProductionId::analysis("S0", "A0"),
            TAG,
            root.join("working/S0/A0"),
        );
        production.config_file = root.join("checkouts/S0/A0.ini");
        set_path_mapping(&mut production.meta, "executable", Value::from("/usr/bin/run"));
        set_path_mapping(&mut production.meta, "arguments", Value::from("--ini {config}"));
        set_path_mapping(&mut production.meta, "scheduler.request memory", Value::from("4 GB"));
        production
    }

    #[tokio::test]
    async fn test_build_writes_submit_file() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path(), ProcessConfig::default());
        let store = Mutex::new(workspace.open_store().unwrap());
        let scheduler = MemoryScheduler::new();
        let ctx = PipelineContext {
            workspace: &workspace,
            scheduler: &scheduler,
            store: &store,
            dryrun: false,
        };
        let mut production = production(dir.path());

        CommandPipeline.build_dag(&mut production, &ctx).await.unwrap();
        let text = std::fs::read_to_string(production.rundir.join("A0.sub")).unwrap();
        assert!(text.contains("executable = /usr/bin/run\n"));
        assert!(text.contains(&format!("--ini {}", production.config_file.display())));
        assert!(text.contains("request_memory = 4 GB\n"));

        let id = CommandPipeline.submit_dag(&mut production, &ctx).await.unwrap();
        assert_eq!(id, Some(ClusterId(1)));
        let (_, submitted) = scheduler.submissions().pop().unwrap();
        assert_eq!(submitted.batch_name.as_deref(), Some("S0/A0/A0"));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path(), ProcessConfig::default());
        let store = Mutex::new(workspace.open_store().unwrap());
        let scheduler = MemoryScheduler::new();
        let ctx = PipelineContext {
            workspace: &workspace,
            scheduler: &scheduler,
            store: &store,
            dryrun: false,
        };
        let mut production =
            Production::new(ProductionId::analysis("S0", "A0"), TAG, dir.path().join("run"));
        let err = CommandPipeline.build_dag(&mut production, &ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::BuildFailed(_)));
        assert!(!production.rundir.exists());
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path(), ProcessConfig::default());
        let store = Mutex::new(workspace.open_store().unwrap());
        let scheduler = MemoryScheduler::new();
        let ctx = PipelineContext {
            workspace: &workspace,
            scheduler: &scheduler,
            store: &store,
            dryrun: true,
        };
        let mut production = production(dir.path());
        CommandPipeline.build_dag(&mut production, &ctx).await.unwrap();
        assert_eq!(CommandPipeline.submit_dag(&mut production, &ctx).await.unwrap(), None);
        assert!(!production.rundir.exists());
        assert!(scheduler.submissions().is_empty());
    }
}
