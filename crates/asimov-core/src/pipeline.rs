//! Pipeline plugin contract
//!
//! A pipeline adapts one analysis backend to the supervisor. The supervisor
//! only ever calls the capabilities below; everything else about a backend
//! (argument syntax, DAG format, sampler internals) stays inside the plugin.
//!
//! # Core Concepts
//!
//! - **Production**: the plugin receives the materialised production and may
//!   update its bookkeeping (`scheduler.job id`, `postprocessing.status`);
//!   the supervisor persists those changes and owns every status transition
//!   except the ones documented on each method
//! - **Dry run**: with [`PipelineContext::dryrun`] set, plugins must not
//!   touch the scheduler, the store or the filesystem
//! - **Registry**: tags map to constructors, populated at process start
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = PipelineRegistry::new();
//! registry.register("command", || Arc::new(CommandPipeline::new()) as Arc<dyn Pipeline>);
//! let plugin = registry.create("command")?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use asimov_artifact::{ResultsStore, StoreError, StoredResource};
use asimov_kernel::scheduler::{ClusterId, Scheduler};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PipelineError;
use crate::model::Production;
use crate::workspace::Workspace;

/// Resubmissions allowed before a production is left `stuck`
pub const DEFAULT_RESURRECTION_CAP: u32 = 5;

/// Upper bound on a single plugin operation
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Everything a plugin may touch during one call
pub struct PipelineContext<'a> {
    pub workspace: &'a Workspace,
    pub scheduler: &'a dyn Scheduler,
    pub store: &'a Mutex<ResultsStore>,
    pub dryrun: bool,
}

impl fmt::Debug for PipelineContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("root", &self.workspace.root())
            .field("dryrun", &self.dryrun)
            .finish_non_exhaustive()
    }
}

impl PipelineContext<'_> {
    /// Bound for scheduler commands issued by plugins
    pub fn scheduler_timeout(&self) -> Duration {
        Duration::from_secs(self.workspace.config().condor.timeout)
    }

    /// `(group, user)` accounting tags for submitted jobs
    pub fn accounting(&self) -> (&str, &str) {
        let config = self.workspace.config();
        (&config.pipelines.accounting, &config.condor.user)
    }
}

/// Sampler progress reported by `check_progress`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub iterations: u64,
    pub score: f64,
}

/// The capability surface every analysis backend implements
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Registry tag
    fn name(&self) -> &str;

    /// Resubmission budget
    fn resurrection_cap(&self) -> u32 {
        DEFAULT_RESURRECTION_CAP
    }

    /// Deadline for each plugin operation
    fn operation_timeout(&self) -> Duration {
        DEFAULT_OPERATION_TIMEOUT
    }

    /// Extension of the rendered configuration file
    fn config_extension(&self) -> &str {
        "ini"
    }

    /// Template used when the project supplies none
    fn default_template(&self) -> Option<&str> {
        None
    }

    /// Materialise a submittable job graph under the run directory
    async fn build_dag(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError>;

    /// Hand the job graph to the scheduler; `None` on a dry run
    async fn submit_dag(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<Option<ClusterId>, PipelineError>;

    /// Last chance to edit submit descriptions
    async fn before_submit(
        &self,
        _production: &mut Production,
        _ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Called on every pass while the job runs
    async fn while_running(
        &self,
        _production: &mut Production,
        _ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Whether the primary job's results are complete; false when uncertain
    async fn detect_completion(&self, production: &Production, ctx: &PipelineContext<'_>) -> bool;

    /// Whether post-processing has finished; false when uncertain
    ///
    /// The default suits pipelines without a post-processing job.
    async fn detect_completion_processing(
        &self,
        _production: &Production,
        _ctx: &PipelineContext<'_>,
    ) -> bool {
        true
    }

    /// Start post-processing; may record a new `scheduler.job id`
    async fn after_completion(
        &self,
        _production: &mut Production,
        _ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Finalise and archive outputs
    async fn after_processing(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        let assets = self.collect_assets(production);
        archive_assets(production, &assets, ctx)?;
        production.set_postprocessing_status("finished");
        Ok(())
    }

    /// Logical name to path of produced artifacts
    fn collect_assets(&self, _production: &Production) -> BTreeMap<String, PathBuf> {
        BTreeMap::new()
    }

    /// Log file name to content
    fn collect_logs(&self, production: &Production) -> BTreeMap<String, String> {
        read_logs(production)
    }

    /// Posterior sample files
    fn samples(&self, _production: &Production) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Worker to progress, for status displays
    fn check_progress(&self, _production: &Production) -> BTreeMap<String, Progress> {
        BTreeMap::new()
    }

    /// Wipe the run directory
    async fn clean(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        if ctx.dryrun {
            tracing::info!("Would remove {}", production.rundir.display());
            return Ok(());
        }
        if production.rundir.exists() {
            tokio::fs::remove_dir_all(&production.rundir)
                .await
                .map_err(|e| PipelineError::io(&production.rundir, e))?;
            tracing::info!("Removed run directory {}", production.rundir.display());
        }
        Ok(())
    }

    /// Resubmit within the budget
    ///
    /// Processing productions re-run `after_completion`; everything else
    /// resubmits the primary job graph.
    async fn resurrect(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        let cap = self.resurrection_cap();
        let count = production.resurrections();
        if count >= cap {
            return Err(PipelineError::ResurrectionExhausted { count, cap });
        }
        production.set_resurrections(count + 1);
        tracing::info!(
            production = %production.id,
            "Resurrecting ({} of {})",
            count + 1,
            cap
        );
        if production.status == asimov_kernel::state_machine::AnalysisStatus::Processing {
            return self.after_completion(production, ctx).await;
        }
        if let Some(id) = self.submit_dag(production, ctx).await? {
            production.set_job_id(id);
        }
        Ok(())
    }

    /// Remove the job from the scheduler and forget its id
    async fn eject_job(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        if let Some(id) = production.job_id() {
            if ctx.dryrun {
                tracing::info!("Would remove job {}", id);
                return Ok(());
            }
            if let Err(e) = ctx.scheduler.remove(id).await {
                tracing::warn!(
                    production = %production.id,
                    job_id = %id,
                    "Removing job failed: {}",
                    e
                );
            }
            production.clear_job_id();
        }
        Ok(())
    }
}

/// Copy assets into the results store under the production's location
///
/// Re-archiving identical bytes at the same location is a no-op, so a
/// resurrected post-processing step can archive again.
///
/// # Errors
/// [`PipelineError::ArchiveFailed`] for any other store failure
pub fn archive_assets(
    production: &Production,
    assets: &BTreeMap<String, PathBuf>,
    ctx: &PipelineContext<'_>,
) -> Result<Vec<StoredResource>, PipelineError> {
    let (subject, analysis) = production.store_location();
    if ctx.dryrun {
        for (name, path) in assets {
            tracing::info!("Would archive {} as {}/{}/{}", path.display(), subject, analysis, name);
        }
        return Ok(Vec::new());
    }
    let mut store = ctx.store.lock();
    let mut stored = Vec::new();
    for (name, path) in assets {
        match store.add_file(&subject, &analysis, path, Some(name)) {
            Ok(resource) => {
                tracing::info!(
                    production = %production.id,
                    "Archived {} ({})",
                    resource.name,
                    resource.hash
                );
                stored.push(resource);
            }
            Err(StoreError::AlreadyPresent { location, .. })
                if location == format!("{subject}/{analysis}/{name}") =>
            {
                tracing::debug!("{} already archived", location);
            }
            Err(e) => return Err(PipelineError::ArchiveFailed(e)),
        }
    }
    Ok(stored)
}

fn read_logs(production: &Production) -> BTreeMap<String, String> {
    let Ok(entries) = fs::read_dir(&production.rundir) else {
        return BTreeMap::new();
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e, "log" | "err" | "out"))
        })
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            let text = fs::read_to_string(&path).ok()?;
            Some((name, text))
        })
        .collect()
}

type Constructor = Box<dyn Fn() -> Arc<dyn Pipeline> + Send + Sync>;

/// Tag to plugin constructor
#[derive(Default)]
pub struct PipelineRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("tags", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PipelineRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor; tags are case-insensitive
    pub fn register<F>(&mut self, tag: &str, constructor: F)
    where
        F: Fn() -> Arc<dyn Pipeline> + Send + Sync + 'static,
    {
        tracing::debug!("Registered pipeline {}", tag);
        self.constructors
            .insert(tag.to_ascii_lowercase(), Box::new(constructor));
    }

    /// Register a shared instance
    pub fn register_instance(&mut self, tag: &str, pipeline: Arc<dyn Pipeline>) {
        self.register(tag, move || Arc::clone(&pipeline));
    }

    /// Instantiate the plugin for a tag
    ///
    /// # Errors
    /// [`PipelineError::UnknownPipeline`] if nothing is registered
    pub fn create(&self, tag: &str) -> Result<Arc<dyn Pipeline>, PipelineError> {
        self.constructors
            .get(&tag.to_ascii_lowercase())
            .map(|constructor| constructor())
            .ok_or_else(|| PipelineError::UnknownPipeline(tag.to_string()))
    }

    /// True if `tag` resolves to a plugin
    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(&tag.to_ascii_lowercase())
    }

    /// Registered tags in sorted order
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}
