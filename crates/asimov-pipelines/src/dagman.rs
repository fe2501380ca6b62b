//! DAGMan pipeline
//!
//! Builds a multi-stage HTCondor DAG from the production's `stages` list and
//! runs it under `condor_dagman` in the scheduler universe:
//!
//! ```yaml
//! stages:
//!   - name: generation
//!     executable: /usr/bin/generate
//!     arguments: [--ini, "{config}"]
//!   - name: inference
//!     executable: /usr/bin/infer
//!     parents: [generation]
//!     retry: 2
//! assets:
//!   posterior: inference/posterior.h5
//! ```
//!
//! # Core Concepts
//!
//! - **Stage**: one node of the DAG with its own submit file and logs
//! - **Rescue**: DAGMan writes a rescue DAG when a node fails; resubmitting
//!   the same DAG resumes from it, so resurrection is cheap and the budget
//!   is large
//! - **Completion**: DAGMan's own log records its exit status; zero means
//!   every node succeeded

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use asimov_core::{Pipeline, PipelineContext, PipelineError, Production, Progress};
use asimov_kernel::dag::DependencyGraph;
use asimov_kernel::scheduler::{submit_file_text, ClusterId, JobDescription};
use asimov_merge::{get_path_mapping, scalar_string, Mapping, Value};
use async_trait::async_trait;

use crate::common::{
    assets_present, existing_assets, job_description, sample_files, stem, string_list, write_file,
};

/// Registry tag
pub const TAG: &str = "dagman";

/// Resubmissions allowed; each one resumes from the rescue DAG
pub const DAGMAN_RESURRECTION_CAP: u32 = 90;

const DAGMAN_EXECUTABLE: &str = "/usr/bin/condor_dagman";

/// DAGMan's exit policy: leave the queue on success, abort or crash
const DAGMAN_EXIT_POLICY: &str =
    "(ExitSignal =?= 11 || (ExitCode =!= UNDEFINED && ExitCode >= 0 && ExitCode <= 2))";

/// One node of the workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub executable: String,
    pub arguments: Vec<String>,
    pub parents: Vec<String>,
    /// Node retries before DAGMan gives up on it
    pub retry: u32,
}

impl Stage {
    fn from_node(node: &Mapping, production: &Production) -> Result<Self, String> {
        let field = |name: &str| node.get(Value::String(name.to_string()));
        let name = field("name")
            .and_then(scalar_string)
            .ok_or_else(|| format!("{}: stage without a name", production.id))?;
        let executable = field("executable")
            .and_then(scalar_string)
            .ok_or_else(|| format!("{}: stage {} has no executable", production.id, name))?;
        let retry = match field("retry") {
            None => 0,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    format!("{}: stage {} has an invalid retry count", production.id, name)
                })?,
        };
        Ok(Self {
            executable,
            arguments: string_list(field("arguments")),
            parents: string_list(field("parents")),
            retry,
            name,
        })
    }

    fn stem(&self, production: &Production) -> String {
        format!("{}_{}", stem(production), self.name)
    }
}

/// Parse and validate the `stages` list
///
/// # Errors
/// [`PipelineError::BuildFailed`] for an empty list, a malformed or
/// duplicated stage, an unknown parent or a cycle
pub fn stages(production: &Production) -> Result<Vec<Stage>, PipelineError> {
    let failed = PipelineError::BuildFailed;
    let items = match get_path_mapping(&production.meta, "stages") {
        Some(Value::Sequence(items)) if !items.is_empty() => items,
        _ => return Err(failed(format!("{} defines no stages", production.id))),
    };

    let mut stages = Vec::with_capacity(items.len());
    let mut names = HashSet::new();
    for item in items {
        let Value::Mapping(node) = item else {
            return Err(failed(format!("{}: stages must be mappings", production.id)));
        };
        let stage = Stage::from_node(node, production).map_err(failed)?;
        if !names.insert(stage.name.clone()) {
            return Err(failed(format!("{}: stage {} defined twice", production.id, stage.name)));
        }
        stages.push(stage);
    }

    let mut graph = DependencyGraph::new();
    for stage in &stages {
        graph.add_node(&stage.name);
        for parent in &stage.parents {
            if !names.contains(parent) {
                return Err(failed(format!(
                    "{}: stage {} needs unknown stage {}",
                    production.id, stage.name, parent
                )));
            }
            graph
                .add_dependency(&stage.name, parent)
                .map_err(|e| failed(format!("{}: {}", production.id, e)))?;
        }
    }
    Ok(stages)
}

/// Render the DAG description
pub fn dag_text(stages: &[Stage], production: &Production) -> String {
    let mut text = String::new();
    for stage in stages {
        let _ = writeln!(text, "JOB {} {}.sub", stage.name, stage.stem(production));
    }
    for stage in stages.iter().filter(|s| s.retry > 0) {
        let _ = writeln!(text, "RETRY {} {}", stage.name, stage.retry);
    }
    for stage in stages.iter().filter(|s| !s.parents.is_empty()) {
        let _ = writeln!(text, "PARENT {} CHILD {}", stage.parents.join(" "), stage.name);
    }
    text
}

/// Exit status from the last `EXITING WITH STATUS` line of a `dagman.out`
pub fn dagman_exit_status(text: &str) -> Option<i32> {
    text.lines()
        .rev()
        .find_map(|line| line.split("EXITING WITH STATUS").nth(1))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|code| code.parse().ok())
}

/// `(done, total)` from the last node status table in a `dagman.out`
pub fn dagman_progress(text: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut latest = None;
    let mut after_rule = false;
    for line in text.lines() {
        if let Some(rest) = line.split("Of ").nth(1) {
            let count = rest
                .strip_suffix("nodes total:")
                .or_else(|| rest.strip_suffix("nodes total"));
            if let Some(count) = count {
                total = count.trim().parse::<u64>().ok();
            }
        }
        if line.contains("===") {
            after_rule = true;
            continue;
        }
        if after_rule {
            after_rule = false;
            let counts: Vec<u64> = line
                .split_whitespace()
                .rev()
                .take(7)
                .filter_map(|t| t.parse().ok())
                .collect();
            if let (7, Some(total)) = (counts.len(), total) {
                // reversed: the first column, Done, is last
                latest = Some((counts[6], total));
            }
        }
    }
    latest
}

/// Multi-stage workflow run by DAGMan
#[derive(Debug, Clone, Copy, Default)]
pub struct DagmanPipeline;

impl DagmanPipeline {
    /// The plugin; stages come from production metadata
    pub fn new() -> Self {
        Self
    }

    fn dag_file(production: &Production) -> String {
        format!("{}.dag", stem(production))
    }

    fn dagman_out(production: &Production) -> PathBuf {
        production.rundir.join(format!("{}.dagman.out", Self::dag_file(production)))
    }

    /// The DAGMan job itself, as `condor_submit_dag` would describe it
    fn dagman_job(production: &Production, ctx: &PipelineContext<'_>) -> JobDescription {
        let dag = Self::dag_file(production);
        let executable = production
            .meta_str("dagman.executable")
            .unwrap_or_else(|| DAGMAN_EXECUTABLE.to_string());
        let rundir = &production.rundir;
        let (group, user) = ctx.accounting();
        let lockfile = format!("{dag}.lock");
        let arguments = [
            "-p",
            "0",
            "-f",
            "-l",
            ".",
            "-Lockfile",
            lockfile.as_str(),
            "-AutoRescue",
            "1",
            "-DoRescueFrom",
            "0",
            "-Dag",
            dag.as_str(),
            "-Suppress_notification",
            "-Dagman",
            executable.as_str(),
        ];
        let mut description = JobDescription::new(&executable)
            .universe("scheduler")
            .arguments(arguments)
            .working_directory(rundir)
            .logs(
                rundir.join(format!("{dag}.dagman.log")),
                rundir.join(format!("{dag}.lib.out")),
                rundir.join(format!("{dag}.lib.err")),
            )
            .batch_name(production.id.to_string())
            .accounting(group, user)
            .extra("remove_kill_sig", "SIGUSR1")
            .extra("on_exit_remove", DAGMAN_EXIT_POLICY)
            .submit_file(rundir.join(format!("{dag}.condor.sub")));
        description.getenv = true;
        description
    }

    fn read_dagman_out(production: &Production) -> Option<String> {
        fs::read_to_string(Self::dagman_out(production)).ok()
    }
}

#[async_trait]
impl Pipeline for DagmanPipeline {
    fn name(&self) -> &str {
        TAG
    }

    fn resurrection_cap(&self) -> u32 {
        DAGMAN_RESURRECTION_CAP
    }

    async fn build_dag(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<(), PipelineError> {
        let stages = stages(production)?;
        let dag = production.rundir.join(Self::dag_file(production));
        if ctx.dryrun {
            tracing::info!("Would write {} with {} stages", dag.display(), stages.len());
            return Ok(());
        }

        for stage in &stages {
            let stem = stage.stem(production);
            let description =
                job_description(production, ctx, &stem, &stage.executable, &stage.arguments);
            let path = production.rundir.join(format!("{stem}.sub"));
            write_file(&path, &submit_file_text(&description)).await?;
        }
        write_file(&dag, &dag_text(&stages, production)).await?;
        tracing::info!(
            production = %production.id,
            "Wrote {} ({} stages)",
            dag.display(),
            stages.len()
        );
        Ok(())
    }

    async fn submit_dag(
        &self,
        production: &mut Production,
        ctx: &PipelineContext<'_>,
    ) -> Result<Option<ClusterId>, PipelineError> {
        let description = Self::dagman_job(production, ctx);
        if ctx.dryrun {
            tracing::info!("Would submit {}", Self::dag_file(production));
            return Ok(None);
        }
        let dag = production.rundir.join(Self::dag_file(production));
        if !dag.is_file() {
            return Err(PipelineError::SubmitFailed(format!("{} does not exist", dag.display())));
        }
        let id = ctx.scheduler.submit(&description).await?;
        tracing::info!(production = %production.id, job_id = %id, "Submitted {}", dag.display());
        Ok(Some(id))
    }

    async fn detect_completion(&self, production: &Production, _ctx: &PipelineContext<'_>) -> bool {
        Self::read_dagman_out(production)
            .and_then(|text| dagman_exit_status(&text))
            .is_some_and(|code| code == 0)
            && assets_present(production)
    }

    fn collect_assets(&self, production: &Production) -> BTreeMap<String, PathBuf> {
        existing_assets(production)
    }

    fn samples(&self, production: &Production) -> Vec<PathBuf> {
        sample_files(production)
    }

    fn check_progress(&self, production: &Production) -> BTreeMap<String, Progress> {
        let progress = Self::read_dagman_out(production).and_then(|text| dagman_progress(&text));
        let Some((done, total)) = progress else {
            return BTreeMap::new();
        };
        #[allow(clippy::cast_precision_loss)]
        let score = if total == 0 { 0.0 } else { done as f64 / total as f64 };
        BTreeMap::from([(
            "dagman".to_string(),
            Progress {
                iterations: done,
                score,
            },
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asimov_core::ProductionId;
    use pretty_assertions::assert_eq;

    const DAGMAN_OUT: &str = "\
05/01/24 10:00:00 Of 3 nodes total:
05/01/24 10:00:00  Done     Pre   Queued    Post   Ready   Un-Ready   Failed
05/01/24 10:00:00   ===     ===      ===     ===     ===        ===      ===
05/01/24 10:00:00     0       0        1       0       0          2        0
05/01/24 11:00:00 Of 3 nodes total:
05/01/24 11:00:00  Done     Pre   Queued    Post   Ready   Un-Ready   Failed
05/01/24 11:00:00   ===     ===      ===     ===     ===        ===      ===
05/01/24 11:00:00     2       0        1       0       0          0        0
";

    fn with_stages(yaml: &str) -> Production {
        let mut production =
            Production::new(ProductionId::analysis("S0", "A0"), TAG, "/work/S0/A0");
        let stages: Value = serde_yaml::from_str(yaml).unwrap();
        production.meta.insert(Value::from("stages"), stages);
        production
    }

    #[test]
    fn test_dag_text() {
        let production = with_stages(
            "- {name: generate, executable: /bin/gen}\n\
             - {name: infer, executable: /bin/infer, parents: [generate], retry: 2}\n\
             - {name: summarise, executable: /bin/sum, parents: generate infer}\n",
        );
        let stages = stages(&production).unwrap();
        assert_eq!(
            dag_text(&stages, &production),
            "JOB generate A0_generate.sub\n\
             JOB infer A0_infer.sub\n\
             JOB summarise A0_summarise.sub\n\
             RETRY infer 2\n\
             PARENT generate CHILD infer\n\
             PARENT generate infer CHILD summarise\n"
        );
    }

    #[test]
    fn test_invalid_stages_fail_build() {
        for yaml in [
            "[]",
            "- {name: a}\n",
            "- {name: a, executable: /bin/a}\n- {name: a, executable: /bin/b}\n",
            "- {name: a, executable: /bin/a, parents: [ghost]}\n",
            "- {name: a, executable: /bin/a, parents: [b]}\n\
             - {name: b, executable: /bin/b, parents: [a]}\n",
        ] {
            let production = with_stages(yaml);
            assert!(
                matches!(stages(&production), Err(PipelineError::BuildFailed(_))),
                "accepted {yaml}"
            );
        }
    }

    #[test]
    fn test_exit_status_uses_last_line() {
        let text = "10:00 EXITING WITH STATUS 1\n11:00 Running rescue DAG\n\
                    12:00 **** condor_scheduniv_exec.42.0 (condor_DAGMAN) pid 7 \
                    EXITING WITH STATUS 0\n";
        assert_eq!(dagman_exit_status(text), Some(0));
        assert_eq!(dagman_exit_status("no exit yet\n"), None);
    }

    #[test]
    fn test_progress_reads_last_table() {
        assert_eq!(dagman_progress(DAGMAN_OUT), Some((2, 3)));
        assert_eq!(dagman_progress(""), None);
    }
}
