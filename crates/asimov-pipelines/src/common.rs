//! Metadata and job-file helpers shared by the bundled plugins

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use asimov_core::{PipelineContext, PipelineError, Production};
use asimov_kernel::scheduler::JobDescription;
use asimov_merge::{get_path_mapping, scalar_string, Value};

/// User-log event code written when a job leaves the queue
const TERMINATED_EVENT: &str = "005 ";

const NORMAL_EXIT: &str = "Normal termination (return value 0)";

/// A list given either as a sequence or as a whitespace-separated string
pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(items)) => items.iter().filter_map(scalar_string).collect(),
        Some(other) => scalar_string(other)
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

/// File-name stem for a production's job files
pub(crate) fn stem(production: &Production) -> String {
    production.id.name().replace(['/', ' '], "_")
}

/// Expand `{config}`, `{rundir}`, `{name}` and `{subject}` in an argument
pub(crate) fn expand(argument: &str, production: &Production) -> String {
    argument
        .replace("{config}", &production.config_file.display().to_string())
        .replace("{rundir}", &production.rundir.display().to_string())
        .replace("{name}", production.id.name())
        .replace("{subject}", production.id.subject().unwrap_or("project"))
}

/// Description of one job running in the production's run directory
///
/// Logs and the submit file are named after `stem`; resource requests come
/// from the resolved `scheduler` section.
pub(crate) fn job_description(
    production: &Production,
    ctx: &PipelineContext<'_>,
    stem: &str,
    executable: &str,
    arguments: &[String],
) -> JobDescription {
    let (group, user) = ctx.accounting();
    let rundir = &production.rundir;
    let mut description = JobDescription::new(executable)
        .arguments(arguments.iter().map(|a| expand(a, production)))
        .working_directory(rundir)
        .logs(
            rundir.join(format!("{stem}.log")),
            rundir.join(format!("{stem}.out")),
            rundir.join(format!("{stem}.err")),
        )
        .batch_name(format!("{}/{stem}", production.id))
        .accounting(group, user)
        .submit_file(rundir.join(format!("{stem}.sub")));

    description.request_cpus = production
        .meta_str("scheduler.request cpus")
        .and_then(|s| s.trim().parse().ok());
    description.request_memory = production.meta_str("scheduler.request memory");
    description.request_disk = production.meta_str("scheduler.request disk");
    description.getenv = production
        .meta_str("scheduler.getenv")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    description
}

/// Write a job file, creating the run directory on first use
pub(crate) async fn write_file(path: &Path, text: &str) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::io(parent, e))?;
    }
    tokio::fs::write(path, text)
        .await
        .map_err(|e| PipelineError::io(path, e))
}

/// Whether the last termination event in an HTCondor user log reports exit 0
///
/// A missing or unreadable log counts as not terminated.
pub(crate) fn terminated_normally(log: &Path) -> bool {
    let Ok(text) = fs::read_to_string(log) else {
        return false;
    };
    let mut events = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.trim() == "..." {
            events.push(std::mem::take(&mut current));
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    events
        .iter()
        .rev()
        .find(|event| event.trim_start().starts_with(TERMINATED_EVENT))
        .is_some_and(|event| event.contains(NORMAL_EXIT))
}

/// `assets` mapping of logical name to path relative to the run directory
pub(crate) fn declared_assets(production: &Production) -> BTreeMap<String, PathBuf> {
    let Some(Value::Mapping(assets)) = get_path_mapping(&production.meta, "assets") else {
        return BTreeMap::new();
    };
    assets
        .iter()
        .filter_map(|(name, path)| {
            let name = scalar_string(name)?;
            Some((name, production.rundir.join(scalar_string(path)?)))
        })
        .collect()
}

/// Declared assets that exist on disk
pub(crate) fn existing_assets(production: &Production) -> BTreeMap<String, PathBuf> {
    declared_assets(production)
        .into_iter()
        .filter(|(_, path)| path.is_file())
        .collect()
}

/// Whether every declared asset exists
pub(crate) fn assets_present(production: &Production) -> bool {
    declared_assets(production).values().all(|path| path.is_file())
}

/// `samples` paths that exist on disk
pub(crate) fn sample_files(production: &Production) -> Vec<PathBuf> {
    string_list(get_path_mapping(&production.meta, "samples"))
        .into_iter()
        .map(|path| production.rundir.join(path))
        .filter(|path| path.is_file())
        .collect()
}
